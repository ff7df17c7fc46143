//! The checkpointer.
//!
//! A checkpoint makes everything up to the last closed transaction durable
//! in the store itself, so recovery can start reading the transaction log
//! from that point instead of from the beginning.
//!
//! ## Checkpoint cycle
//!
//! 1. Read the last closed transaction and batch from the metadata provider
//! 2. Flush and force the store through the [`IoLimiter`]
//! 3. Make sure the database has not panicked in the meantime
//! 4. Append the checkpoint record to the checkpoint log
//! 5. Re-base the threshold and prune transaction logs no longer needed
//!
//! Every entry point takes the [`StoreCopyCheckpointMutex`] for writing, so
//! at most one checkpoint runs at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use durastore_storage::{
    AppendBatchInfo, CheckpointAppender, LogPosition, LogPruner, TransactionId,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};
use crate::error::CheckpointError;
use crate::health::Health;
use crate::io_limit::IoLimiter;
use crate::metadata::{MetadataProvider, StoreFlusher};
use crate::mutex::StoreCopyCheckpointMutex;
use crate::stats::CheckpointStats;
use crate::threshold::CheckpointThreshold;

/// Returned when no checkpoint was performed.
pub const NO_CHECKPOINT: i64 = -1;

/// Slice of time [`Checkpointer::try_check_point_with_timeout`] waits for
/// the lock before re-checking its predicate.
const LOCK_POLL_SLICE: Duration = Duration::from_millis(100);

/// Who asked for a checkpoint, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerInfo {
    /// Name of the caller, e.g. `"Scheduled checkpoint"`.
    pub trigger: String,
    /// What made the checkpoint due, when a threshold decided.
    pub reason: Option<String>,
}

impl TriggerInfo {
    /// Trigger without a reason.
    #[must_use]
    pub fn new(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            reason: None,
        }
    }

    /// Same trigger with `reason` attached.
    #[must_use]
    pub fn with_reason(&self, reason: impl Into<String>) -> Self {
        Self {
            trigger: self.trigger.clone(),
            reason: Some(reason.into()),
        }
    }

    /// Text stored in the checkpoint record.
    #[must_use]
    pub fn describe(&self, transaction_id: i64, append_index: i64) -> String {
        let reason = self
            .reason
            .as_deref()
            .map(|r| format!(" for {r}"))
            .unwrap_or_default();
        format!(
            "Checkpoint triggered by \"{}\"{reason} @ txId: {transaction_id}, append index: {append_index}",
            self.trigger
        )
    }
}

/// The last checkpoint this checkpointer completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestCheckpointInfo {
    /// Last closed transaction at the time of the checkpoint.
    pub transaction_id: TransactionId,
    /// Append index the checkpoint covers.
    pub append_index: i64,
    /// Position in the transaction log recovery starts from.
    pub position: LogPosition,
}

impl LatestCheckpointInfo {
    /// Nothing checkpointed yet.
    pub const UNKNOWN: Self = Self {
        transaction_id: TransactionId::UNKNOWN,
        append_index: NO_CHECKPOINT,
        position: LogPosition::UNSPECIFIED,
    };
}

/// Something that can be asked to checkpoint when due.
pub trait CheckpointTrigger: Send + Sync {
    /// Checkpoint if a threshold says so. Returns the checkpointed append
    /// index, or [`NO_CHECKPOINT`].
    ///
    /// # Errors
    ///
    /// Returns the error of a failed checkpoint.
    fn check_point_if_needed(&self, trigger: &TriggerInfo) -> Result<i64, CheckpointError>;
}

/// Coordinates checkpoints of a single database.
pub struct Checkpointer {
    metadata: Arc<dyn MetadataProvider>,
    flusher: Arc<dyn StoreFlusher>,
    appender: Arc<dyn CheckpointAppender>,
    health: Arc<dyn Health>,
    io_limiter: Arc<IoLimiter>,
    pruner: Option<LogPruner>,
    mutex: Arc<StoreCopyCheckpointMutex>,
    clock: Arc<dyn Clock>,
    threshold: Mutex<Box<dyn CheckpointThreshold>>,
    started: AtomicBool,
    shut_down: AtomicBool,
    latest: RwLock<LatestCheckpointInfo>,
    stats: CheckpointStats,
}

impl Checkpointer {
    /// Create a checkpointer. It must be [`start`](Self::start)ed before
    /// threshold driven checkpoints are accepted.
    #[must_use]
    pub fn new(
        metadata: Arc<dyn MetadataProvider>,
        flusher: Arc<dyn StoreFlusher>,
        appender: Arc<dyn CheckpointAppender>,
        health: Arc<dyn Health>,
        threshold: Box<dyn CheckpointThreshold>,
    ) -> Self {
        Self {
            metadata,
            flusher,
            appender,
            health,
            io_limiter: Arc::new(IoLimiter::unlimited()),
            pruner: None,
            mutex: Arc::new(StoreCopyCheckpointMutex::new()),
            clock: Arc::new(SystemClock::new()),
            threshold: Mutex::new(threshold),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            latest: RwLock::new(LatestCheckpointInfo::UNKNOWN),
            stats: CheckpointStats::new(),
        }
    }

    /// Pace store flushes through `limiter`.
    #[must_use]
    pub fn with_io_limiter(mut self, limiter: Arc<IoLimiter>) -> Self {
        self.io_limiter = limiter;
        self
    }

    /// Prune transaction logs after each checkpoint.
    #[must_use]
    pub fn with_pruner(mut self, pruner: LogPruner) -> Self {
        self.pruner = Some(pruner);
        self
    }

    /// Share the checkpoint lock with store copies.
    #[must_use]
    pub fn with_mutex(mut self, mutex: Arc<StoreCopyCheckpointMutex>) -> Self {
        self.mutex = mutex;
        self
    }

    /// Timestamp checkpoint records with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Initialize the threshold from the last closed batch.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::ThresholdAlreadyInitialized`] if called
    /// twice.
    pub fn start(&self) -> Result<(), CheckpointError> {
        let batch = self.metadata.last_closed_batch();
        self.threshold
            .lock()
            .initialize(batch.append_index, batch.log_position_after)?;
        self.started.store(true, Ordering::Release);
        debug!(append_index = batch.append_index, "checkpointer started");
        Ok(())
    }

    /// Checkpoint regardless of thresholds, waiting for a running checkpoint
    /// to finish first. I/O limits are lifted while the caller waits.
    ///
    /// # Errors
    ///
    /// Returns the error of the failed checkpoint.
    pub fn force_check_point(&self, trigger: &TriggerInfo) -> Result<i64, CheckpointError> {
        let _unlimited = self.io_limiter.unlimited_scope();
        let _guard = self.mutex.checkpoint();
        if self.is_shut_down() {
            return Ok(NO_CHECKPOINT);
        }
        self.do_check_point(trigger)
    }

    /// Checkpoint if nobody else is. If a checkpoint is already running,
    /// wait for it and return what it checkpointed instead of running
    /// another.
    ///
    /// # Errors
    ///
    /// Returns the error of the failed checkpoint.
    pub fn try_check_point(&self, trigger: &TriggerInfo) -> Result<i64, CheckpointError> {
        let _unlimited = self.io_limiter.unlimited_scope();
        if let Some(_guard) = self.mutex.try_checkpoint() {
            return self.run_if_not_shut_down(trigger);
        }
        let _guard = self.mutex.checkpoint();
        Ok(self.observed_append_index())
    }

    /// As [`try_check_point`](Self::try_check_point), but gives up with
    /// [`NO_CHECKPOINT`] once `timed_out` returns true. The predicate is
    /// re-checked between bounded attempts to take the lock.
    ///
    /// # Errors
    ///
    /// Returns the error of the failed checkpoint.
    pub fn try_check_point_with_timeout(
        &self,
        trigger: &TriggerInfo,
        timed_out: &dyn Fn() -> bool,
    ) -> Result<i64, CheckpointError> {
        let _unlimited = self.io_limiter.unlimited_scope();
        if let Some(_guard) = self.mutex.try_checkpoint() {
            return self.run_if_not_shut_down(trigger);
        }
        loop {
            if timed_out() {
                return Ok(NO_CHECKPOINT);
            }
            if let Some(_guard) = self.mutex.try_checkpoint_for(LOCK_POLL_SLICE) {
                return Ok(self.observed_append_index());
            }
        }
    }

    /// Checkpoint only if the lock is free right now.
    ///
    /// # Errors
    ///
    /// Returns the error of the failed checkpoint.
    pub fn try_check_point_no_wait(&self, trigger: &TriggerInfo) -> Result<i64, CheckpointError> {
        match self.mutex.try_checkpoint() {
            Some(_guard) => self.run_if_not_shut_down(trigger),
            None => Ok(NO_CHECKPOINT),
        }
    }

    /// Evaluate `threshold` instead of the configured one and checkpoint if
    /// it is due.
    ///
    /// # Errors
    ///
    /// Returns the error of the failed checkpoint.
    pub fn check_point_with_threshold(
        &self,
        threshold: &dyn CheckpointThreshold,
        trigger: &TriggerInfo,
    ) -> Result<i64, CheckpointError> {
        let _guard = self.mutex.checkpoint();
        if self.is_shut_down() {
            return Ok(NO_CHECKPOINT);
        }
        self.run_if_due(threshold, trigger)
    }

    /// Last completed checkpoint.
    #[must_use]
    pub fn latest_check_point_info(&self) -> LatestCheckpointInfo {
        *self.latest.read()
    }

    /// Wait for a running checkpoint, then refuse all further work.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint log cannot be shut down.
    pub fn shutdown(&self) -> Result<(), CheckpointError> {
        let _guard = self.mutex.checkpoint();
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.appender.shutdown()?;
        info!("checkpointer shut down");
        Ok(())
    }

    /// Checkpoint counters.
    #[must_use]
    pub fn stats(&self) -> &CheckpointStats {
        &self.stats
    }

    /// How often the configured threshold wants to be polled.
    #[must_use]
    pub fn check_frequency(&self) -> Duration {
        self.threshold.lock().check_frequency()
    }

    /// Lock shared with store copies.
    #[must_use]
    pub fn mutex(&self) -> &Arc<StoreCopyCheckpointMutex> {
        &self.mutex
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn observed_append_index(&self) -> i64 {
        if self.is_shut_down() {
            return NO_CHECKPOINT;
        }
        self.latest.read().append_index
    }

    fn run_if_not_shut_down(&self, trigger: &TriggerInfo) -> Result<i64, CheckpointError> {
        if self.is_shut_down() {
            return Ok(NO_CHECKPOINT);
        }
        self.do_check_point(trigger)
    }

    fn run_if_due(
        &self,
        threshold: &dyn CheckpointThreshold,
        trigger: &TriggerInfo,
    ) -> Result<i64, CheckpointError> {
        match self.due_reason(threshold) {
            Some(reason) => self.do_check_point(&trigger.with_reason(reason)),
            None => Ok(NO_CHECKPOINT),
        }
    }

    /// Reason a checkpoint is due according to `threshold`, if it is.
    fn due_reason(&self, threshold: &dyn CheckpointThreshold) -> Option<String> {
        let batch = self.metadata.last_closed_batch();
        let mut reason = None;
        let due = threshold.is_check_pointing_needed(
            batch.append_index,
            batch.log_position_after,
            &mut |r: String| reason = Some(r),
        );
        due.then(|| reason.unwrap_or_default())
    }

    /// Runs one checkpoint. The caller holds the checkpoint lock.
    fn do_check_point(&self, trigger: &TriggerInfo) -> Result<i64, CheckpointError> {
        let start = Instant::now();
        let closed = self.metadata.last_closed_transaction();
        let batch = self.metadata.last_closed_batch();
        let description = trigger.describe(closed.transaction_id.id, batch.append_index);

        debug!(
            append_index = batch.append_index,
            trigger = %trigger.trigger,
            "starting checkpoint"
        );

        if let Err(e) = self.write_check_point(
            closed.transaction_id,
            closed.log_position,
            batch,
            &description,
        ) {
            self.stats.record_failure();
            error!(append_index = batch.append_index, error = %e, "checkpoint failed");
            return Err(e);
        }

        if self.started.load(Ordering::Acquire) {
            self.threshold
                .lock()
                .check_point_happened(batch.append_index, batch.log_position_after);
        }

        *self.latest.write() = LatestCheckpointInfo {
            transaction_id: closed.transaction_id,
            append_index: batch.append_index,
            position: batch.log_position_after,
        };

        let duration = start.elapsed();
        self.stats.record_success(batch.append_index, duration);
        info!(
            append_index = batch.append_index,
            duration_ms = duration.as_millis(),
            "{description} checkpoint completed"
        );

        if let Some(pruner) = &self.pruner {
            let pruned = pruner.prune_upto(batch.log_position_after)?;
            if !pruned.is_empty() {
                debug!(versions = ?pruned, "pruned transaction logs after checkpoint");
            }
        }
        Ok(batch.append_index)
    }

    fn write_check_point(
        &self,
        transaction_id: TransactionId,
        checkpointed_position: LogPosition,
        batch: AppendBatchInfo,
        description: &str,
    ) -> Result<(), CheckpointError> {
        self.flusher.flush_and_force(&self.io_limiter)?;
        self.health.assert_no_panic()?;
        self.appender.check_point(
            transaction_id,
            batch.append_index,
            self.metadata.kernel_version(),
            batch.log_position_after,
            checkpointed_position,
            self.clock.wall(),
            description,
        )?;
        Ok(())
    }
}

impl CheckpointTrigger for Checkpointer {
    fn check_point_if_needed(&self, trigger: &TriggerInfo) -> Result<i64, CheckpointError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(CheckpointError::NotStarted);
        }
        let _guard = self.mutex.checkpoint();
        if self.is_shut_down() {
            return Ok(NO_CHECKPOINT);
        }
        let reason = self.due_reason(&**self.threshold.lock());
        match reason {
            Some(reason) => self.do_check_point(&trigger.with_reason(reason)),
            None => Ok(NO_CHECKPOINT),
        }
    }
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .field("latest", &*self.latest.read())
            .field("pruner", &self.pruner)
            .finish_non_exhaustive()
    }
}
