//! Collaborators the checkpointer reads from and writes through.

use durastore_storage::{AppendBatchInfo, KernelVersion, LogPosition, TransactionId};

use crate::error::CheckpointError;
use crate::io_limit::IoLimiter;

/// The last transaction whose effects are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedTransaction {
    /// Transaction identity.
    pub transaction_id: TransactionId,
    /// Position right after its commit entry.
    pub log_position: LogPosition,
}

/// Source of the store's transaction progress.
pub trait MetadataProvider: Send + Sync {
    /// Last closed transaction.
    fn last_closed_transaction(&self) -> ClosedTransaction;

    /// Last closed batch. May run ahead of the last closed transaction when
    /// transactions are written in chunks.
    fn last_closed_batch(&self) -> AppendBatchInfo;

    /// Format the store is currently written in.
    fn kernel_version(&self) -> KernelVersion;
}

/// Makes the store's in-memory state durable.
pub trait StoreFlusher: Send + Sync {
    /// Flush dirty pages and fsync them, pacing I/O through `limiter`.
    ///
    /// # Errors
    ///
    /// Returns an error if anything could not be made durable.
    fn flush_and_force(&self, limiter: &IoLimiter) -> Result<(), CheckpointError>;
}
