//! Background checkpoint job.
//!
//! The scheduler wakes up every `interval`, asks its [`CheckpointTrigger`]
//! whether a checkpoint is due, and goes back to sleep. The check runs on
//! the blocking pool since flushing the store does synchronous I/O.
//!
//! Failures are tolerated up to [`MAX_CONSECUTIVE_FAILURES_TOLERANCE`] in a
//! row. Reaching the limit panics the database with every collected cause
//! and ends the job.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpointer::{CheckpointTrigger, Checkpointer, TriggerInfo};
use crate::error::CheckpointError;
use crate::health::Health;
use crate::io_limit::IoLimiter;

/// Consecutive failures after which the database is panicked.
pub const MAX_CONSECUTIVE_FAILURES_TOLERANCE: usize = 10;

/// Trigger name of scheduled checkpoints.
pub const SCHEDULED_TRIGGER: &str = "Scheduled checkpoint";

/// Shared state of the running job.
struct SchedulerContext {
    trigger: Arc<dyn CheckpointTrigger>,
    health: Arc<dyn Health>,
    interval: Duration,
    job_name: String,
    failures: Arc<Mutex<Vec<CheckpointError>>>,
    cancel: CancellationToken,
}

struct Job {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs checkpoints in the background.
pub struct CheckpointScheduler {
    trigger: Arc<dyn CheckpointTrigger>,
    health: Arc<dyn Health>,
    io_limiter: Arc<IoLimiter>,
    interval: Duration,
    job_name: String,
    failures: Arc<Mutex<Vec<CheckpointError>>>,
    job: Mutex<Option<Job>>,
}

impl CheckpointScheduler {
    /// Create a stopped scheduler polling `trigger` every `interval`.
    #[must_use]
    pub fn new(
        trigger: Arc<dyn CheckpointTrigger>,
        health: Arc<dyn Health>,
        io_limiter: Arc<IoLimiter>,
        interval: Duration,
        job_name: impl Into<String>,
    ) -> Self {
        Self {
            trigger,
            health,
            io_limiter,
            interval,
            job_name: job_name.into(),
            failures: Arc::new(Mutex::new(Vec::new())),
            job: Mutex::new(None),
        }
    }

    /// Scheduler for `checkpointer`, polling as often as its threshold asks
    /// for.
    #[must_use]
    pub fn for_checkpointer(
        checkpointer: Arc<Checkpointer>,
        health: Arc<dyn Health>,
        io_limiter: Arc<IoLimiter>,
        job_name: impl Into<String>,
    ) -> Self {
        let interval = checkpointer.check_frequency();
        Self::new(checkpointer, health, io_limiter, interval, job_name)
    }

    /// How long the job sleeps between checks.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the job on the current tokio runtime. Does nothing if it is
    /// already running.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Runtime`] when called outside a runtime.
    pub fn start(&self) -> Result<(), CheckpointError> {
        let mut job = self.job.lock();
        if job.as_ref().is_some_and(|j| !j.handle.is_finished()) {
            return Ok(());
        }
        let runtime =
            Handle::try_current().map_err(|e| CheckpointError::Runtime(e.to_string()))?;

        let cancel = CancellationToken::new();
        let ctx = SchedulerContext {
            trigger: Arc::clone(&self.trigger),
            health: Arc::clone(&self.health),
            interval: self.interval,
            job_name: self.job_name.clone(),
            failures: Arc::clone(&self.failures),
            cancel: cancel.clone(),
        };
        let handle = runtime.spawn(Self::run(ctx));
        *job = Some(Job { cancel, handle });
        info!(
            job = %self.job_name,
            interval_ms = self.interval.as_millis(),
            "checkpoint scheduler started"
        );
        Ok(())
    }

    /// Stop the job and wait for it to exit. A checkpoint in flight runs to
    /// completion with I/O limits lifted. Does nothing if not running.
    pub async fn stop(&self) {
        let job = self.job.lock().take();
        let Some(job) = job else {
            return;
        };
        job.cancel.cancel();
        self.io_limiter.disable_limits();
        if let Err(e) = job.handle.await {
            warn!(job = %self.job_name, error = %e, "checkpoint job ended abnormally");
        }
        self.io_limiter.enable_limits();
        info!(job = %self.job_name, "checkpoint scheduler stopped");
    }

    /// Whether the job is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.job
            .lock()
            .as_ref()
            .is_some_and(|j| !j.handle.is_finished())
    }

    /// Failures since the last successful check.
    #[must_use]
    pub fn consecutive_failures(&self) -> usize {
        self.failures.lock().len()
    }

    async fn run(ctx: SchedulerContext) {
        loop {
            tokio::select! {
                () = ctx.cancel.cancelled() => break,
                () = tokio::time::sleep(ctx.interval) => {}
            }

            let trigger = Arc::clone(&ctx.trigger);
            let outcome = tokio::task::spawn_blocking(move || {
                trigger.check_point_if_needed(&TriggerInfo::new(SCHEDULED_TRIGGER))
            })
            .await
            .unwrap_or_else(|e| Err(CheckpointError::Runtime(e.to_string())));

            if !ctx.record(outcome) {
                break;
            }
        }
        debug!(job = %ctx.job_name, "checkpoint job exited");
    }
}

impl SchedulerContext {
    /// Account for one check. Returns false once the job must end.
    fn record(&self, outcome: Result<i64, CheckpointError>) -> bool {
        let mut failures = self.failures.lock();
        let error = match outcome {
            Ok(_) => {
                failures.clear();
                return true;
            }
            Err(e) => e,
        };

        warn!(
            job = %self.job_name,
            consecutive = failures.len() + 1,
            error = %error,
            "scheduled checkpoint failed"
        );
        failures.push(error);
        if failures.len() < MAX_CONSECUTIVE_FAILURES_TOLERANCE {
            return true;
        }

        let failures = std::mem::take(&mut *failures);
        self.health.panic(CheckpointError::ToleranceExhausted { failures });
        false
    }
}

impl std::fmt::Debug for CheckpointScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointScheduler")
            .field("job_name", &self.job_name)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
