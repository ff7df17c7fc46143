//! Checkpoint configuration.

use std::sync::Arc;
use std::time::Duration;

use durastore_storage::checkpoint::appender::{
    DEFAULT_KEEP_FILES, DEFAULT_ROTATION_SIZE, MAX_KEEP_FILES, MIN_KEEP_FILES, MIN_ROTATION_SIZE,
};
use durastore_storage::{CheckpointLogConfig, RetainAll, RetainFiles, RetainNone, RetentionPolicy};
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;

/// Which thresholds decide that a checkpoint is due.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Whichever of the time and count thresholds fires first.
    #[default]
    Periodic,
    /// Time threshold only.
    Time,
    /// Count threshold only.
    Count,
}

/// How many transaction log files survive pruning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionConfig {
    /// Never delete log files.
    #[default]
    KeepAll,
    /// Keep the newest `n` files.
    KeepFiles(usize),
    /// Delete every file recovery no longer needs.
    KeepNone,
}

impl RetentionConfig {
    /// Policy implementing this setting.
    #[must_use]
    pub fn policy(self) -> Arc<dyn RetentionPolicy> {
        match self {
            Self::KeepAll => Arc::new(RetainAll),
            Self::KeepFiles(n) => Arc::new(RetainFiles(n)),
            Self::KeepNone => Arc::new(RetainNone),
        }
    }
}

/// Configuration of checkpointing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Threshold policy.
    pub policy: CheckpointPolicy,
    /// Time threshold interval in milliseconds. Default: 15 minutes.
    pub interval_ms: u64,
    /// Count threshold in transactions. Default: 100 000, minimum 1.
    pub interval_tx: u64,
    /// I/O operations per second allowed while flushing (`None` = unlimited).
    /// Default: 600.
    pub iops_limit: Option<u32>,
    /// Checkpoint log rotation size in bytes. Default: 1 MiB, minimum 1 KiB.
    pub checkpoint_log_rotation_bytes: u64,
    /// Checkpoint log files kept after rotation. Default: 3, range 2..=100.
    pub checkpoint_log_keep_files: usize,
    /// Treat unreadable log bytes at startup as a fatal error.
    pub fail_on_corrupted_log_files: bool,
    /// Transaction log retention after a checkpoint.
    pub log_retention: RetentionConfig,
    /// Write a final checkpoint when the database shuts down.
    pub checkpoint_on_shutdown: bool,
    /// Name of the background checkpoint job.
    pub scheduler_job_name: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            policy: CheckpointPolicy::Periodic,
            interval_ms: 15 * 60 * 1000,
            interval_tx: 100_000,
            iops_limit: Some(600),
            checkpoint_log_rotation_bytes: DEFAULT_ROTATION_SIZE,
            checkpoint_log_keep_files: DEFAULT_KEEP_FILES,
            fail_on_corrupted_log_files: false,
            log_retention: RetentionConfig::KeepAll,
            checkpoint_on_shutdown: true,
            scheduler_job_name: "checkpoint".to_string(),
        }
    }
}

impl CheckpointConfig {
    /// Parse and validate a JSON document. Missing fields take their
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Config`] if the document does not parse or
    /// fails [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self, CheckpointError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CheckpointError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every setting against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Config`] naming the first invalid setting.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.interval_ms == 0 {
            return Err(CheckpointError::Config("interval_ms must be positive".into()));
        }
        if self.interval_tx < 1 {
            return Err(CheckpointError::Config("interval_tx must be at least 1".into()));
        }
        if self.iops_limit == Some(0) {
            return Err(CheckpointError::Config(
                "iops_limit must be positive; omit it to disable limiting".into(),
            ));
        }
        if self.checkpoint_log_rotation_bytes < MIN_ROTATION_SIZE {
            return Err(CheckpointError::Config(format!(
                "checkpoint_log_rotation_bytes must be at least {MIN_ROTATION_SIZE}"
            )));
        }
        if !(MIN_KEEP_FILES..=MAX_KEEP_FILES).contains(&self.checkpoint_log_keep_files) {
            return Err(CheckpointError::Config(format!(
                "checkpoint_log_keep_files must be within {MIN_KEEP_FILES}..={MAX_KEEP_FILES}"
            )));
        }
        if let RetentionConfig::KeepFiles(0) = self.log_retention {
            return Err(CheckpointError::Config(
                "log_retention keep_files must be positive".into(),
            ));
        }
        if self.scheduler_job_name.trim().is_empty() {
            return Err(CheckpointError::Config("scheduler_job_name must not be empty".into()));
        }
        Ok(())
    }

    /// Time threshold interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Size limits for the checkpoint log.
    #[must_use]
    pub fn checkpoint_log_config(&self) -> CheckpointLogConfig {
        CheckpointLogConfig {
            rotation_size: self.checkpoint_log_rotation_bytes,
            keep_files: self.checkpoint_log_keep_files,
        }
    }
}
