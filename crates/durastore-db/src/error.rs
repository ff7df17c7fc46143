//! Error types for checkpointing.

use durastore_storage::LogError;

/// Errors from checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Transaction or checkpoint log error.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// I/O error outside the logs.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The database has panicked; nothing more may be written.
    #[error("database has panicked: {0}")]
    Panicked(String),

    /// A threshold was initialized a second time.
    #[error("checkpoint threshold already initialized")]
    ThresholdAlreadyInitialized,

    /// The checkpointer was used before `start()`.
    #[error("checkpointer not started")]
    NotStarted,

    /// The scheduler gave up after too many consecutive failures.
    #[error("checkpoint scheduler failed {} consecutive times", failures.len())]
    ToleranceExhausted {
        /// Every failure since the last success, oldest first.
        failures: Vec<CheckpointError>,
    },

    /// Invalid configuration.
    #[error("invalid checkpoint configuration: {0}")]
    Config(String),

    /// The store could not be flushed.
    #[error("store flush failed: {0}")]
    Flush(String),

    /// No async runtime was available to run the scheduler.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl CheckpointError {
    /// Returns true if this error indicates a transient failure that may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::Flush(_) => true,
            Self::Log(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_exhausted_message() {
        let err = CheckpointError::ToleranceExhausted {
            failures: vec![
                CheckpointError::Flush("disk full".into()),
                CheckpointError::Flush("disk full".into()),
            ],
        };
        assert_eq!(err.to_string(), "checkpoint scheduler failed 2 consecutive times");
    }

    #[test]
    fn test_transient_classification() {
        assert!(CheckpointError::Flush("x".into()).is_transient());
        assert!(CheckpointError::Log(LogError::Io(std::io::Error::other("x"))).is_transient());
        assert!(!CheckpointError::ThresholdAlreadyInitialized.is_transient());
        assert!(!CheckpointError::Panicked("x".into()).is_transient());
    }
}
