//! In-memory collaborators for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use durastore_storage::types::{BASE_TX_CHECKSUM, UNKNOWN_CONSENSUS_INDEX};
use durastore_storage::{
    AppendBatchInfo, CheckpointAppender, HealthCheck, KernelVersion, LogError, LogPosition,
    TransactionId,
};
use parking_lot::Mutex;

use crate::checkpointer::{CheckpointTrigger, TriggerInfo, NO_CHECKPOINT};
use crate::clock::Clock;
use crate::error::CheckpointError;
use crate::health::Health;
use crate::io_limit::IoLimiter;
use crate::metadata::{ClosedTransaction, MetadataProvider, StoreFlusher};

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct FakeClock {
    nanos: AtomicU64,
}

impl FakeClock {
    /// Clock at the epoch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(i64::try_from(self.nanos()).unwrap_or(i64::MAX))
    }
}

/// Metadata provider whose progress advances through [`commit`](Self::commit).
#[derive(Debug)]
pub struct FakeMetadataProvider {
    state: Mutex<(ClosedTransaction, AppendBatchInfo)>,
    kernel_version: KernelVersion,
}

impl FakeMetadataProvider {
    /// Store with no transactions yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new((
                ClosedTransaction {
                    transaction_id: TransactionId::BASE,
                    log_position: LogPosition::new(0, 64),
                },
                AppendBatchInfo::new(TransactionId::BASE.append_index, LogPosition::new(0, 64)),
            )),
            kernel_version: KernelVersion::LATEST,
        }
    }

    /// Close the next transaction; returns its append index.
    pub fn commit(&self) -> i64 {
        let mut state = self.state.lock();
        let append_index = state.1.append_index + 1;
        let position = LogPosition::new(0, state.1.log_position_after.byte_offset + 100);
        state.0 = ClosedTransaction {
            transaction_id: TransactionId::new(
                append_index,
                append_index,
                self.kernel_version,
                BASE_TX_CHECKSUM,
                0,
                UNKNOWN_CONSENSUS_INDEX,
            ),
            log_position: position,
        };
        state.1 = AppendBatchInfo::new(append_index, position);
        append_index
    }

    /// Close `n` transactions; returns the last append index.
    pub fn commit_many(&self, n: usize) -> i64 {
        let mut last = self.state.lock().1.append_index;
        for _ in 0..n {
            last = self.commit();
        }
        last
    }
}

impl Default for FakeMetadataProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataProvider for FakeMetadataProvider {
    fn last_closed_transaction(&self) -> ClosedTransaction {
        self.state.lock().0
    }

    fn last_closed_batch(&self) -> AppendBatchInfo {
        self.state.lock().1
    }

    fn kernel_version(&self) -> KernelVersion {
        self.kernel_version
    }
}

/// Flusher that records overlap and limits, and can be slowed or failed.
#[derive(Debug, Default)]
pub struct RecordingFlusher {
    flushes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Mutex<Duration>,
    fail: AtomicBool,
    limited: Mutex<Vec<bool>>,
}

impl RecordingFlusher {
    /// Instant, successful flusher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every flush take `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Make flushes fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Flushes started.
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Most flushes ever running at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Whether I/O limits were active, per flush.
    #[must_use]
    pub fn limited(&self) -> Vec<bool> {
        self.limited.lock().clone()
    }
}

impl StoreFlusher for RecordingFlusher {
    fn flush_and_force(&self, limiter: &IoLimiter) -> Result<(), CheckpointError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.limited.lock().push(limiter.is_limited());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CheckpointError::Flush("injected flush failure".into()));
        }
        Ok(())
    }
}

/// A checkpoint record captured by [`RecordingAppender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedCheckpoint {
    /// Checkpointed transaction.
    pub transaction_id: TransactionId,
    /// Append index covered.
    pub append_index: i64,
    /// Recovery start position.
    pub transaction_log_position: LogPosition,
    /// Description.
    pub reason: String,
}

/// Appender keeping records in memory.
#[derive(Debug, Default)]
pub struct RecordingAppender {
    records: Mutex<Vec<AppendedCheckpoint>>,
    shut_down: AtomicBool,
}

impl RecordingAppender {
    /// Empty appender.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records appended so far.
    #[must_use]
    pub fn records(&self) -> Vec<AppendedCheckpoint> {
        self.records.lock().clone()
    }

    /// Whether [`CheckpointAppender::shutdown`] was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl CheckpointAppender for RecordingAppender {
    fn check_point(
        &self,
        transaction_id: TransactionId,
        append_index: i64,
        _kernel_version: KernelVersion,
        transaction_log_position: LogPosition,
        _checkpointed_position: LogPosition,
        _timestamp: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), LogError> {
        if self.is_shut_down() {
            return Ok(());
        }
        self.records.lock().push(AppendedCheckpoint {
            transaction_id,
            append_index,
            transaction_log_position,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn shutdown(&self) -> Result<(), LogError> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Trigger replaying a script of outcomes, then succeeding.
#[derive(Debug, Default)]
pub struct ScriptedTrigger {
    script: Mutex<VecDeque<Result<i64, CheckpointError>>>,
    calls: AtomicUsize,
    delay: Mutex<Duration>,
}

impl ScriptedTrigger {
    /// Trigger that always succeeds without checkpointing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome.
    pub fn push(&self, outcome: Result<i64, CheckpointError>) {
        self.script.lock().push_back(outcome);
    }

    /// Make every call take `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CheckpointTrigger for ScriptedTrigger {
    fn check_point_if_needed(&self, _trigger: &TriggerInfo) -> Result<i64, CheckpointError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.lock().pop_front().unwrap_or(Ok(NO_CHECKPOINT))
    }
}

/// Health keeping every panic it is handed, not only the first.
#[derive(Debug, Default)]
pub struct RecordingHealth {
    panics: Mutex<Vec<Arc<CheckpointError>>>,
}

impl RecordingHealth {
    /// Healthy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every panic raised, in order.
    #[must_use]
    pub fn panics(&self) -> Vec<Arc<CheckpointError>> {
        self.panics.lock().clone()
    }
}

impl HealthCheck for RecordingHealth {
    fn is_healthy(&self) -> bool {
        self.panics.lock().is_empty()
    }
}

impl Health for RecordingHealth {
    fn assert_no_panic(&self) -> Result<(), CheckpointError> {
        match self.panics.lock().first() {
            Some(cause) => Err(CheckpointError::Panicked(cause.to_string())),
            None => Ok(()),
        }
    }

    fn panic(&self, cause: CheckpointError) {
        self.panics.lock().push(Arc::new(cause));
    }

    fn cause(&self) -> Option<Arc<CheckpointError>> {
        self.panics.lock().first().cloned()
    }
}
