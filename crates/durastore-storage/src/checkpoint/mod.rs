//! Checkpoint log, log tail scanning and log pruning.
//!
//! - [`appender`]: durable, rotating checkpoint log ([`CheckpointLog`])
//! - [`record`]: on-disk checkpoint record
//! - [`tail`]: startup scan producing [`LogTailState`](crate::types::LogTailState)
//! - [`pruning`]: deletion of transaction log files covered by a checkpoint

pub mod appender;
pub mod pruning;
pub mod record;
pub mod tail;

pub use appender::{CheckpointAppender, CheckpointLog, CheckpointLogConfig};
pub use pruning::{LogPruner, RetainAll, RetainFiles, RetainNone, RetentionPolicy};
pub use record::CheckpointRecord;
pub use tail::{LogTailScanMonitor, LogTailScanner, NoopScanMonitor};
