//! Runner-wide configuration (spec.md §1, §3 ambient stack). A future
//! config front-end (out of scope here) populates this from a file; this
//! crate only defines the shape and its defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_console() -> bool {
    true
}

/// Knobs shared by every ride run in one process: where logs and artifacts
/// land, and the default concurrency a `Ride` falls back to when it doesn't
/// set its own `max_concurrency`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    pub log_root: PathBuf,
    pub artifact_root: PathBuf,
    pub default_max_concurrency: Option<usize>,
    #[serde(default = "default_console")]
    pub console: bool,
}

impl RunnerConfig {
    pub fn new(log_root: impl Into<PathBuf>, artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            log_root: log_root.into(),
            artifact_root: artifact_root.into(),
            default_max_concurrency: None,
            console: true,
        }
    }

    pub fn resolved_max_concurrency(&self) -> usize {
        self.default_max_concurrency.unwrap_or_else(num_cpus::get)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new("./.kite/logs", "./.kite/artifacts")
    }
}

/// Installs a `tracing` subscriber reading `RUST_LOG` (falling back to
/// `info`), matching the teacher package's use of `tracing` for structured
/// logging. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
