use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Crate-wide error taxonomy (spec.md §7).
///
/// Config-time and graph-validation errors are represented as data on
/// `ValidationReport`/`SegmentResult`, never as an `Err` returned from the
/// scheduler's public entry point — that type is reserved for genuine
/// infrastructure failures (cannot spawn a process, cannot write a log
/// file, a poisoned lock, malformed JSON on disk) that legitimately abort
/// the operation in progress.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("segment name must not be blank")]
    BlankSegmentName,

    #[error("segment {0:?} timeout must be positive")]
    NonPositiveTimeout(String),

    #[error("ride maxConcurrency must be positive, got {0}")]
    NonPositiveConcurrency(i64),

    #[error("artifact name must not be blank")]
    BlankArtifactName,

    #[error("artifact source path does not exist: {0}")]
    ArtifactSourceMissing(String),

    #[error("process spawn failed: {0}")]
    Spawn(String),

    #[error("process exited with code {code}")]
    ExitCode { code: i32, stdout: String, stderr: String },

    #[error("process timed out after {0:?}")]
    ProcessTimeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunnerError {
    /// Short type-tag used by `retryOn` substring matching (spec.md §4.5,
    /// §9 Open Questions). Stands in for a Java-style exception class name.
    pub fn type_tag(&self) -> &'static str {
        match self {
            RunnerError::Spawn(_) => "SpawnException",
            RunnerError::ExitCode { .. } => "ExitCodeException",
            RunnerError::ProcessTimeout(_) => "TimeoutException",
            RunnerError::Io(_) => "IOException",
            RunnerError::Json(_) => "SerializationException",
            RunnerError::BlankArtifactName | RunnerError::ArtifactSourceMissing(_) => {
                "ArtifactException"
            }
            RunnerError::BlankSegmentName
            | RunnerError::NonPositiveTimeout(_)
            | RunnerError::NonPositiveConcurrency(_) => "ConfigException",
            RunnerError::Other(_) => "RuntimeException",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tag_is_stable_per_variant() {
        assert_eq!(RunnerError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).type_tag(), "IOException");
        assert_eq!(
            RunnerError::ProcessTimeout(std::time::Duration::from_secs(1)).type_tag(),
            "TimeoutException"
        );
    }
}
