//! Integration tests: background scheduler failure handling and shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use durastore_db::testing::{
    FakeMetadataProvider, RecordingAppender, RecordingFlusher, RecordingHealth, ScriptedTrigger,
};
use durastore_db::threshold::DEFAULT_CHECKING_FREQUENCY;
use durastore_db::{
    CheckpointError, CheckpointScheduler, Checkpointer, CountThreshold, IoLimiter,
    SystemClock, TimeThreshold, MAX_CONSECUTIVE_FAILURES_TOLERANCE,
};
use durastore_storage::HealthCheck;

const TICK: Duration = Duration::from_millis(2);

fn scheduler(trigger: Arc<ScriptedTrigger>, health: Arc<RecordingHealth>) -> CheckpointScheduler {
    CheckpointScheduler::new(
        trigger,
        health,
        Arc::new(IoLimiter::unlimited()),
        TICK,
        "checkpoint",
    )
}

async fn wait_for_calls(trigger: &ScriptedTrigger, calls: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while trigger.calls() < calls {
        assert!(Instant::now() < deadline, "scheduler stalled at {} calls", trigger.calls());
        tokio::time::sleep(TICK).await;
    }
}

fn flush_failure(n: usize) -> CheckpointError {
    CheckpointError::Flush(format!("failure {n}"))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failures_below_tolerance_never_panic() {
    let trigger = Arc::new(ScriptedTrigger::new());
    for n in 0..MAX_CONSECUTIVE_FAILURES_TOLERANCE - 1 {
        trigger.push(Err(flush_failure(n)));
    }
    trigger.push(Ok(42));
    for n in 0..MAX_CONSECUTIVE_FAILURES_TOLERANCE - 1 {
        trigger.push(Err(flush_failure(n)));
    }

    let health = Arc::new(RecordingHealth::new());
    let scheduler = scheduler(trigger.clone(), health.clone());
    scheduler.start().unwrap();

    wait_for_calls(&trigger, 2 * MAX_CONSECUTIVE_FAILURES_TOLERANCE + 5).await;
    scheduler.stop().await;

    assert!(health.is_healthy());
    assert!(health.panics().is_empty());
    assert_eq!(scheduler.consecutive_failures(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tolerance_exhausted_panics_once_with_all_causes() {
    let trigger = Arc::new(ScriptedTrigger::new());
    for n in 0..MAX_CONSECUTIVE_FAILURES_TOLERANCE + 5 {
        trigger.push(Err(flush_failure(n)));
    }

    let health = Arc::new(RecordingHealth::new());
    let scheduler = scheduler(trigger.clone(), health.clone());
    scheduler.start().unwrap();

    wait_for_calls(&trigger, MAX_CONSECUTIVE_FAILURES_TOLERANCE).await;
    // Give a runaway loop the chance to call again.
    tokio::time::sleep(TICK * 20).await;
    assert!(!scheduler.is_running());
    scheduler.stop().await;

    assert_eq!(trigger.calls(), MAX_CONSECUTIVE_FAILURES_TOLERANCE);
    let panics = health.panics();
    assert_eq!(panics.len(), 1);
    match &*panics[0] {
        CheckpointError::ToleranceExhausted { failures } => {
            assert_eq!(failures.len(), MAX_CONSECUTIVE_FAILURES_TOLERANCE);
            for (n, failure) in failures.iter().enumerate() {
                assert_eq!(failure.to_string(), flush_failure(n).to_string());
            }
        }
        other => panic!("unexpected panic cause: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_waits_for_running_checkpoint() {
    let metadata = Arc::new(FakeMetadataProvider::new());
    let flusher = Arc::new(RecordingFlusher::new());
    let appender = Arc::new(RecordingAppender::new());
    let health = Arc::new(RecordingHealth::new());
    let limiter = Arc::new(IoLimiter::new(Some(600)));
    let checkpointer = Arc::new(
        Checkpointer::new(
            metadata.clone(),
            flusher.clone(),
            appender.clone(),
            health.clone(),
            Box::new(CountThreshold::new(1)),
        )
        .with_io_limiter(limiter.clone()),
    );
    checkpointer.start().unwrap();
    let last = metadata.commit();
    flusher.set_delay(Duration::from_millis(300));

    let scheduler = CheckpointScheduler::new(
        checkpointer.clone(),
        health,
        limiter.clone(),
        TICK,
        "checkpoint",
    );
    scheduler.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while flusher.flushes() == 0 {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(TICK).await;
    }
    scheduler.stop().await;

    // The in-flight checkpoint finished before stop returned.
    let records = appender.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].append_index, last);
    assert!(limiter.is_limited());
    assert_eq!(flusher.limited(), vec![true]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scheduler_polls_at_threshold_frequency() {
    let metadata = Arc::new(FakeMetadataProvider::new());
    let appender = Arc::new(RecordingAppender::new());
    let health = Arc::new(RecordingHealth::new());
    let interval = Duration::from_millis(20);
    let checkpointer = Arc::new(Checkpointer::new(
        metadata.clone(),
        Arc::new(RecordingFlusher::new()),
        appender.clone(),
        health.clone(),
        Box::new(TimeThreshold::new(interval, Arc::new(SystemClock::new()))),
    ));
    checkpointer.start().unwrap();

    let scheduler = CheckpointScheduler::for_checkpointer(
        checkpointer.clone(),
        health,
        Arc::new(IoLimiter::unlimited()),
        "checkpoint",
    );
    assert_eq!(scheduler.interval(), interval);

    let last = metadata.commit();
    scheduler.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while appender.records().is_empty() {
        assert!(Instant::now() < deadline, "no scheduled checkpoint");
        tokio::time::sleep(TICK).await;
    }
    scheduler.stop().await;

    let records = appender.records();
    assert_eq!(records[0].append_index, last);
    assert!(records[0].reason.contains("time threshold of 20ms"));
}

#[test]
fn test_count_threshold_scheduler_uses_default_frequency() {
    let health = Arc::new(RecordingHealth::new());
    let checkpointer = Arc::new(Checkpointer::new(
        Arc::new(FakeMetadataProvider::new()),
        Arc::new(RecordingFlusher::new()),
        Arc::new(RecordingAppender::new()),
        health.clone(),
        Box::new(CountThreshold::new(5)),
    ));
    let scheduler = CheckpointScheduler::for_checkpointer(
        checkpointer,
        health,
        Arc::new(IoLimiter::unlimited()),
        "checkpoint",
    );
    assert_eq!(scheduler.interval(), DEFAULT_CHECKING_FREQUENCY);
}
