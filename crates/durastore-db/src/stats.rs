//! Checkpoint counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::checkpointer::NO_CHECKPOINT;

/// Counters updated by every checkpoint attempt.
#[derive(Debug)]
pub struct CheckpointStats {
    checkpoints_completed: AtomicU64,
    checkpoints_failed: AtomicU64,
    last_checkpoint_duration_ms: AtomicU64,
    last_checkpointed_append_index: AtomicI64,
}

/// Point-in-time copy of [`CheckpointStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointStatsSnapshot {
    /// Successful checkpoints.
    pub checkpoints_completed: u64,
    /// Failed checkpoint attempts.
    pub checkpoints_failed: u64,
    /// Duration of the last successful checkpoint.
    pub last_checkpoint_duration_ms: u64,
    /// Append index of the last successful checkpoint, or `-1`.
    pub last_checkpointed_append_index: i64,
}

impl CheckpointStats {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            checkpoints_completed: AtomicU64::new(0),
            checkpoints_failed: AtomicU64::new(0),
            last_checkpoint_duration_ms: AtomicU64::new(0),
            last_checkpointed_append_index: AtomicI64::new(NO_CHECKPOINT),
        }
    }

    pub(crate) fn record_success(&self, append_index: i64, duration: Duration) {
        self.checkpoints_completed.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        self.last_checkpoint_duration_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
        self.last_checkpointed_append_index
            .store(append_index, Ordering::Release);
    }

    pub(crate) fn record_failure(&self) {
        self.checkpoints_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Append index of the last successful checkpoint, or
    /// [`NO_CHECKPOINT`].
    #[must_use]
    pub fn last_checkpointed_append_index(&self) -> i64 {
        self.last_checkpointed_append_index.load(Ordering::Acquire)
    }

    /// Copy all counters.
    #[must_use]
    pub fn snapshot(&self) -> CheckpointStatsSnapshot {
        CheckpointStatsSnapshot {
            checkpoints_completed: self.checkpoints_completed.load(Ordering::Relaxed),
            checkpoints_failed: self.checkpoints_failed.load(Ordering::Relaxed),
            last_checkpoint_duration_ms: self.last_checkpoint_duration_ms.load(Ordering::Relaxed),
            last_checkpointed_append_index: self.last_checkpointed_append_index(),
        }
    }
}

impl Default for CheckpointStats {
    fn default() -> Self {
        Self::new()
    }
}
