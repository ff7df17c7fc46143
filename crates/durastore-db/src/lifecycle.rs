//! Checkpoints bracketing the database's life: one right after recovery
//! and one on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use durastore_storage::HealthCheck;
use tracing::{info, warn};

use crate::checkpointer::{Checkpointer, TriggerInfo};
use crate::error::CheckpointError;
use crate::health::Health;
use crate::threshold::RecoveryThreshold;

/// Trigger name of the checkpoint taken on shutdown.
pub const SHUTDOWN_TRIGGER: &str = "Database shutdown";

/// Trigger name of the checkpoint taken after recovery.
pub const RECOVERY_TRIGGER: &str = "Recovery completed.";

/// Starts the checkpointer and takes the final checkpoint on shutdown.
pub struct CheckpointerLifecycle {
    checkpointer: Arc<Checkpointer>,
    health: Arc<dyn Health>,
    checkpoint_on_shutdown: AtomicBool,
}

impl CheckpointerLifecycle {
    /// Wrap `checkpointer`.
    #[must_use]
    pub fn new(
        checkpointer: Arc<Checkpointer>,
        health: Arc<dyn Health>,
        checkpoint_on_shutdown: bool,
    ) -> Self {
        Self {
            checkpointer,
            health,
            checkpoint_on_shutdown: AtomicBool::new(checkpoint_on_shutdown),
        }
    }

    /// Start the checkpointer.
    ///
    /// # Errors
    ///
    /// See [`Checkpointer::start`].
    pub fn start(&self) -> Result<(), CheckpointError> {
        self.checkpointer.start()
    }

    /// Enable or disable the shutdown checkpoint.
    pub fn set_checkpoint_on_shutdown(&self, enabled: bool) {
        self.checkpoint_on_shutdown.store(enabled, Ordering::Release);
    }

    /// Take the final checkpoint, unless disabled or the database has
    /// panicked, then shut the checkpointer down.
    ///
    /// # Errors
    ///
    /// Returns the error of the final checkpoint or of the shutdown.
    pub fn shutdown(&self) -> Result<(), CheckpointError> {
        let mut final_checkpoint = Ok(());
        if self.checkpoint_on_shutdown.load(Ordering::Acquire) {
            if self.health.is_healthy() {
                final_checkpoint = self
                    .checkpointer
                    .force_check_point(&TriggerInfo::new(SHUTDOWN_TRIGGER))
                    .map(|_| ());
            } else {
                warn!("skipping shutdown checkpoint: database is not healthy");
            }
        }
        // The checkpointer is shut down even when the final checkpoint failed.
        let shutdown = self.checkpointer.shutdown();
        if let Err(e) = &final_checkpoint {
            warn!(error = %e, "shutdown checkpoint failed");
        }
        final_checkpoint.and(shutdown)
    }

    /// The managed checkpointer.
    #[must_use]
    pub fn checkpointer(&self) -> &Arc<Checkpointer> {
        &self.checkpointer
    }
}

impl std::fmt::Debug for CheckpointerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointerLifecycle")
            .field(
                "checkpoint_on_shutdown",
                &self.checkpoint_on_shutdown.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Checkpoint once recovery has replayed the logs, so a crash right after
/// startup does not replay them again. Returns the checkpointed append
/// index.
///
/// # Errors
///
/// Returns the error of the checkpoint.
pub fn check_point_after_recovery(checkpointer: &Checkpointer) -> Result<i64, CheckpointError> {
    let append_index = checkpointer.check_point_with_threshold(
        &RecoveryThreshold::new(),
        &TriggerInfo::new(RECOVERY_TRIGGER),
    )?;
    info!(append_index, "checkpointed after recovery");
    Ok(append_index)
}
