//! Error types for the transaction log and the checkpoint log.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{LogPosition, StoreId};

/// Errors raised while reading or writing log files.
#[derive(Debug, Error)]
pub enum LogError {
    /// I/O error on a log or checkpoint file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An entry could not be read back.
    #[error("corrupted log entry at {position}: {reason}")]
    CorruptedLog {
        /// Position of the first unreadable byte.
        position: LogPosition,
        /// What was wrong with the entry.
        reason: String,
    },

    /// The latest checkpoint refers to data that is not in the log files.
    #[error(
        "last checkpoint position {position}: checkpoint does not point to a valid location in transaction logs."
    )]
    CheckpointOutsideLogs {
        /// Transaction log position recorded in the checkpoint.
        position: LogPosition,
    },

    /// A log file belongs to another store.
    #[error("store id mismatch: expected {expected}, found {found}")]
    StoreIdMismatch {
        /// Store id the caller expected.
        expected: StoreId,
        /// Store id in the file header.
        found: StoreId,
    },

    /// A checkpoint was requested for an unknown transaction on a
    /// non-empty store.
    #[error("cannot checkpoint unknown transaction at append index {append_index}")]
    UnknownTransactionId {
        /// Append index the checkpoint was requested for.
        append_index: i64,
    },

    /// A file header is missing or malformed.
    #[error("invalid header in {}: {reason}", path.display())]
    InvalidHeader {
        /// File with the bad header.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// Encountered a kernel version this build cannot decode.
    #[error("unsupported kernel version byte {0}")]
    UnsupportedKernelVersion(u8),
}

impl LogError {
    /// Returns true if this error indicates a transient failure that may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Returns true if this error indicates data corruption.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptedLog { .. } | Self::InvalidHeader { .. } | Self::CheckpointOutsideLogs { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_outside_logs_message() {
        let err = LogError::CheckpointOutsideLogs {
            position: LogPosition::new(8, 120),
        };
        let msg = err.to_string();
        assert!(msg.contains("LogPosition{logVersion=8,"));
        assert!(msg.contains("checkpoint does not point to a valid location in transaction logs."));
    }

    #[test]
    fn test_classification() {
        let io = LogError::Io(std::io::Error::other("disk"));
        assert!(io.is_transient());
        assert!(!io.is_corruption());

        let corrupt = LogError::CorruptedLog {
            position: LogPosition::new(0, 64),
            reason: "crc mismatch".into(),
        };
        assert!(corrupt.is_corruption());
        assert!(!corrupt.is_transient());
    }
}
