//! Transaction log pruning after a checkpoint.
//!
//! Once a checkpoint covers a position, every log file older than the file
//! holding that position is no longer needed for recovery. Whether such
//! files are actually deleted is up to the [`RetentionPolicy`].

use std::sync::Arc;

use tracing::debug;

use crate::error::LogError;
use crate::log::LogFiles;
use crate::types::LogPosition;

/// Decides which log files that recovery no longer needs may be deleted.
pub trait RetentionPolicy: Send + Sync + std::fmt::Debug {
    /// Given the existing versions (ascending) and the version holding the
    /// checkpoint, return the versions to delete. Implementations must never
    /// return `checkpoint_version` or anything newer.
    fn versions_to_prune(&self, versions: &[u64], checkpoint_version: u64) -> Vec<u64>;
}

/// Keep every log file.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetainAll;

impl RetentionPolicy for RetainAll {
    fn versions_to_prune(&self, _versions: &[u64], _checkpoint_version: u64) -> Vec<u64> {
        Vec::new()
    }
}

/// Keep the newest `n` files, and always every file recovery needs.
#[derive(Debug, Clone, Copy)]
pub struct RetainFiles(pub usize);

impl RetentionPolicy for RetainFiles {
    fn versions_to_prune(&self, versions: &[u64], checkpoint_version: u64) -> Vec<u64> {
        let excess = versions.len().saturating_sub(self.0);
        versions
            .iter()
            .take(excess)
            .copied()
            .filter(|&v| v < checkpoint_version)
            .collect()
    }
}

/// Delete every file recovery does not need.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetainNone;

impl RetentionPolicy for RetainNone {
    fn versions_to_prune(&self, versions: &[u64], checkpoint_version: u64) -> Vec<u64> {
        versions
            .iter()
            .copied()
            .filter(|&v| v < checkpoint_version)
            .collect()
    }
}

/// Applies a [`RetentionPolicy`] to the transaction log.
pub struct LogPruner {
    log_files: Arc<dyn LogFiles>,
    policy: Arc<dyn RetentionPolicy>,
}

impl LogPruner {
    /// Create a pruner.
    #[must_use]
    pub fn new(log_files: Arc<dyn LogFiles>, policy: Arc<dyn RetentionPolicy>) -> Self {
        Self { log_files, policy }
    }

    /// Delete the files the policy releases, given that everything before
    /// `checkpoint_position` is covered by a checkpoint. Returns the deleted
    /// versions.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory cannot be listed or a file
    /// cannot be deleted.
    pub fn prune_upto(&self, checkpoint_position: LogPosition) -> Result<Vec<u64>, LogError> {
        if !checkpoint_position.is_specified() {
            return Ok(Vec::new());
        }
        let versions = self.log_files.versions()?;
        let mut doomed = self
            .policy
            .versions_to_prune(&versions, checkpoint_position.log_version);
        doomed.retain(|&v| v < checkpoint_position.log_version);

        for &version in &doomed {
            self.log_files.delete_version(version)?;
            debug!(version, "pruned transaction log file");
        }
        Ok(doomed)
    }
}

impl std::fmt::Debug for LogPruner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPruner")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
