//! Lock shared by checkpoints and store copies.
//!
//! A checkpoint needs exclusive access; store copies (backups) only need to
//! know that no checkpoint runs underneath them and may overlap each other.

use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Checkpoint side holds the write half, store copies the read half.
#[derive(Debug, Default)]
pub struct StoreCopyCheckpointMutex {
    lock: RwLock<()>,
}

impl StoreCopyCheckpointMutex {
    /// Create an unlocked mutex.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until a checkpoint may run.
    pub fn checkpoint(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    /// Checkpoint access if immediately available.
    pub fn try_checkpoint(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.lock.try_write()
    }

    /// Checkpoint access if available within `timeout`.
    pub fn try_checkpoint_for(&self, timeout: Duration) -> Option<RwLockWriteGuard<'_, ()>> {
        self.lock.try_write_for(timeout)
    }

    /// Block until no checkpoint runs; shared with other store copies.
    pub fn store_copy(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Whether a checkpoint currently holds the lock.
    #[must_use]
    pub fn is_checkpointing(&self) -> bool {
        self.lock.is_locked_exclusive()
    }
}
