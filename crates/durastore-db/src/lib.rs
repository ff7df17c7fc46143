//! # Durastore DB
//!
//! Checkpointing for durastore. Decides when a checkpoint is due, runs it
//! against the store and the checkpoint log, and drives it from a
//! background job.
//!
//! ## Components
//!
//! - [`threshold`]: time, count and combined checkpoint policies
//! - [`Checkpointer`]: runs checkpoints under the store copy lock
//! - [`CheckpointScheduler`]: periodic background checks
//! - [`CheckpointerLifecycle`]: shutdown checkpoint and the one after recovery

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod checkpointer;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod io_limit;
pub mod lifecycle;
pub mod metadata;
pub mod mutex;
pub mod scheduler;
pub mod stats;
pub mod threshold;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use checkpointer::{
    CheckpointTrigger, Checkpointer, LatestCheckpointInfo, TriggerInfo, NO_CHECKPOINT,
};
pub use clock::{Clock, SystemClock};
pub use config::{CheckpointConfig, CheckpointPolicy, RetentionConfig};
pub use error::CheckpointError;
pub use health::{DatabaseHealth, Health};
pub use io_limit::IoLimiter;
pub use lifecycle::{check_point_after_recovery, CheckpointerLifecycle};
pub use metadata::{ClosedTransaction, MetadataProvider, StoreFlusher};
pub use mutex::StoreCopyCheckpointMutex;
pub use scheduler::{CheckpointScheduler, MAX_CONSECUTIVE_FAILURES_TOLERANCE};
pub use stats::{CheckpointStats, CheckpointStatsSnapshot};
pub use threshold::{
    AnyThreshold, CheckpointThreshold, CountThreshold, RecoveryThreshold, TimeThreshold,
};
