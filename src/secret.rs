//! Secret masking (C0): redacts registered secret values from any text
//! before it reaches a log file, the console, or captured process output.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

const PLACEHOLDER: &str = "***";
const MIN_SECRET_LEN: usize = 4;

/// Scoped to one invocation. Registration is additive only — secrets
/// accumulate for the life of the runner and are never removed, so that a
/// value registered early (e.g. from environment) stays masked in output
/// produced later by any segment.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    secrets: Arc<RwLock<HashSet<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value to redact. Values shorter than a minimum length are
    /// ignored — masking them would redact far too much ordinary text.
    pub fn register(&self, secret: impl Into<String>) {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            return;
        }
        self.secrets.write().insert(secret);
    }

    pub fn register_all<I, S>(&self, secrets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for s in secrets {
            self.register(s);
        }
    }

    /// Replace every occurrence of every registered secret with a fixed
    /// placeholder. Idempotent: masking already-masked text is a no-op,
    /// since the placeholder is never itself registerable (too short).
    pub fn mask(&self, text: &str) -> String {
        let secrets = self.secrets.read();
        if secrets.is_empty() {
            return text.to_string();
        }

        // Longest-first so a secret that is a substring of another longer
        // secret doesn't get partially masked before the longer match runs.
        let mut ordered: Vec<&String> = secrets.iter().collect();
        ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));

        let mut masked = text.to_string();
        for secret in ordered {
            if masked.contains(secret.as_str()) {
                masked = masked.replace(secret.as_str(), PLACEHOLDER);
            }
        }
        masked
    }

    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_registered_secret() {
        let masker = SecretMasker::new();
        masker.register("super-secret-token");
        assert_eq!(
            masker.mask("the token is super-secret-token in the env"),
            "the token is *** in the env"
        );
    }

    #[test]
    fn rejects_short_secrets() {
        let masker = SecretMasker::new();
        masker.register("ab");
        assert!(masker.is_empty());
    }

    #[test]
    fn mask_is_idempotent() {
        let masker = SecretMasker::new();
        masker.register("super-secret-token");
        let once = masker.mask("token=super-secret-token");
        let twice = masker.mask(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn masks_longest_match_first() {
        let masker = SecretMasker::new();
        masker.register("abcdef");
        masker.register("abcdefghij");
        let out = masker.mask("value is abcdefghij here");
        assert_eq!(out, "value is *** here");
    }

    #[test]
    fn registration_is_additive() {
        let masker = SecretMasker::new();
        masker.register("first-secret");
        masker.register("second-secret");
        assert_eq!(masker.len(), 2);
    }
}
