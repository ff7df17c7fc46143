//! # Durastore Storage
//!
//! Durability layer for durastore: rotating transaction log files, the
//! checkpoint log, and the startup scan that reconstructs the log tail.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod checkpoint;
pub mod error;
pub mod health;
pub mod log;
pub mod types;

pub use checkpoint::{
    CheckpointAppender, CheckpointLog, CheckpointLogConfig, LogPruner, LogTailScanMonitor,
    LogTailScanner, NoopScanMonitor, RetainAll, RetainFiles, RetainNone, RetentionPolicy,
};
pub use error::LogError;
pub use health::HealthCheck;
pub use log::{LogFiles, TransactionLogFiles, TransactionLogWriter};
pub use types::{
    AppendBatchInfo, CheckpointInfo, ConsensusIndexSource, KernelVersion, LogPosition,
    LogTailState, StoreId, TransactionId,
};
