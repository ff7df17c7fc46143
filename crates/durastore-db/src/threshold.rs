//! Policies deciding when a checkpoint is due.
//!
//! A threshold is initialized once with the store's progress at startup and
//! re-based after every checkpoint. Between those points the checkpointer
//! asks it, with the current append index and log position, whether enough
//! work has accumulated to justify flushing the store.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use durastore_storage::LogPosition;

use crate::clock::Clock;
use crate::config::{CheckpointConfig, CheckpointPolicy};
use crate::error::CheckpointError;

/// Poll period of thresholds that are not themselves time based.
pub const DEFAULT_CHECKING_FREQUENCY: Duration = Duration::from_secs(10);

/// Decides whether a checkpoint is due.
pub trait CheckpointThreshold: Send + Sync {
    /// Set the baseline. Must be called exactly once, before any
    /// [`is_check_pointing_needed`](Self::is_check_pointing_needed).
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::ThresholdAlreadyInitialized`] on a second
    /// call.
    fn initialize(
        &mut self,
        append_index: i64,
        position: LogPosition,
    ) -> Result<(), CheckpointError>;

    /// Whether a checkpoint is due. When it is, `on_triggered` receives a
    /// description of what fired; otherwise it is not called.
    fn is_check_pointing_needed(
        &self,
        append_index: i64,
        position: LogPosition,
        on_triggered: &mut dyn FnMut(String),
    ) -> bool;

    /// A checkpoint covering `append_index` completed; re-base on it.
    fn check_point_happened(&mut self, append_index: i64, position: LogPosition);

    /// How often the scheduler should poll this threshold.
    fn check_frequency(&self) -> Duration;
}

/// Build the threshold selected by `config`.
#[must_use]
pub fn from_config(config: &CheckpointConfig, clock: Arc<dyn Clock>) -> Box<dyn CheckpointThreshold> {
    match config.policy {
        CheckpointPolicy::Time => Box::new(TimeThreshold::new(config.interval(), clock)),
        CheckpointPolicy::Count => Box::new(CountThreshold::new(config.interval_tx)),
        CheckpointPolicy::Periodic => Box::new(AnyThreshold::new(vec![
            Box::new(TimeThreshold::new(config.interval(), clock)),
            Box::new(CountThreshold::new(config.interval_tx)),
        ])),
    }
}

/// Due once `interval` has passed since the last checkpoint, provided
/// something was committed in the meantime.
pub struct TimeThreshold {
    interval: Duration,
    clock: Arc<dyn Clock>,
    // (append index, clock nanos) of the last checkpoint
    baseline: Option<(i64, u64)>,
}

impl TimeThreshold {
    /// Threshold firing every `interval` of `clock` time.
    #[must_use]
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval,
            clock,
            baseline: None,
        }
    }
}

impl CheckpointThreshold for TimeThreshold {
    fn initialize(
        &mut self,
        append_index: i64,
        _position: LogPosition,
    ) -> Result<(), CheckpointError> {
        if self.baseline.is_some() {
            return Err(CheckpointError::ThresholdAlreadyInitialized);
        }
        self.baseline = Some((append_index, self.clock.nanos()));
        Ok(())
    }

    fn is_check_pointing_needed(
        &self,
        append_index: i64,
        _position: LogPosition,
        on_triggered: &mut dyn FnMut(String),
    ) -> bool {
        let Some((last_index, since)) = self.baseline else {
            return false;
        };
        let elapsed = Duration::from_nanos(self.clock.nanos().saturating_sub(since));
        if append_index > last_index && elapsed >= self.interval {
            on_triggered(format!(
                "time threshold of {}",
                format_duration(self.interval)
            ));
            return true;
        }
        false
    }

    fn check_point_happened(&mut self, append_index: i64, _position: LogPosition) {
        self.baseline = Some((append_index, self.clock.nanos()));
    }

    fn check_frequency(&self) -> Duration {
        self.interval
    }
}

impl std::fmt::Debug for TimeThreshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeThreshold")
            .field("interval", &self.interval)
            .field("baseline", &self.baseline)
            .finish_non_exhaustive()
    }
}

/// Due once `interval` transactions were appended since the last checkpoint.
#[derive(Debug)]
pub struct CountThreshold {
    interval: i64,
    baseline: Option<i64>,
}

impl CountThreshold {
    /// Threshold firing every `interval` transactions.
    #[must_use]
    pub fn new(interval: u64) -> Self {
        Self {
            interval: i64::try_from(interval.max(1)).unwrap_or(i64::MAX),
            baseline: None,
        }
    }
}

impl CheckpointThreshold for CountThreshold {
    fn initialize(
        &mut self,
        append_index: i64,
        _position: LogPosition,
    ) -> Result<(), CheckpointError> {
        if self.baseline.is_some() {
            return Err(CheckpointError::ThresholdAlreadyInitialized);
        }
        self.baseline = Some(append_index);
        Ok(())
    }

    fn is_check_pointing_needed(
        &self,
        append_index: i64,
        _position: LogPosition,
        on_triggered: &mut dyn FnMut(String),
    ) -> bool {
        let Some(last_index) = self.baseline else {
            return false;
        };
        if append_index >= last_index.saturating_add(self.interval) {
            on_triggered(format!("count threshold of {} transactions", self.interval));
            return true;
        }
        false
    }

    fn check_point_happened(&mut self, append_index: i64, _position: LogPosition) {
        self.baseline = Some(append_index);
    }

    fn check_frequency(&self) -> Duration {
        DEFAULT_CHECKING_FREQUENCY
    }
}

/// Due when any of its parts is due.
pub struct AnyThreshold {
    parts: Vec<Box<dyn CheckpointThreshold>>,
}

impl AnyThreshold {
    /// Combine `parts`; the first one that fires decides the reason.
    #[must_use]
    pub fn new(parts: Vec<Box<dyn CheckpointThreshold>>) -> Self {
        Self { parts }
    }
}

impl CheckpointThreshold for AnyThreshold {
    fn initialize(
        &mut self,
        append_index: i64,
        position: LogPosition,
    ) -> Result<(), CheckpointError> {
        for part in &mut self.parts {
            part.initialize(append_index, position)?;
        }
        Ok(())
    }

    fn is_check_pointing_needed(
        &self,
        append_index: i64,
        position: LogPosition,
        on_triggered: &mut dyn FnMut(String),
    ) -> bool {
        self.parts
            .iter()
            .any(|part| part.is_check_pointing_needed(append_index, position, on_triggered))
    }

    fn check_point_happened(&mut self, append_index: i64, position: LogPosition) {
        for part in &mut self.parts {
            part.check_point_happened(append_index, position);
        }
    }

    fn check_frequency(&self) -> Duration {
        self.parts
            .iter()
            .map(|part| part.check_frequency())
            .min()
            .unwrap_or(DEFAULT_CHECKING_FREQUENCY)
    }
}

impl std::fmt::Debug for AnyThreshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyThreshold")
            .field("parts", &self.parts.len())
            .finish()
    }
}

/// Always due. Used for the checkpoint that closes recovery.
#[derive(Debug, Default)]
pub struct RecoveryThreshold {
    initialized: bool,
}

impl RecoveryThreshold {
    /// Create the threshold.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointThreshold for RecoveryThreshold {
    fn initialize(
        &mut self,
        _append_index: i64,
        _position: LogPosition,
    ) -> Result<(), CheckpointError> {
        if self.initialized {
            return Err(CheckpointError::ThresholdAlreadyInitialized);
        }
        self.initialized = true;
        Ok(())
    }

    fn is_check_pointing_needed(
        &self,
        _append_index: i64,
        _position: LogPosition,
        on_triggered: &mut dyn FnMut(String),
    ) -> bool {
        on_triggered("recovery".to_string());
        true
    }

    fn check_point_happened(&mut self, _append_index: i64, _position: LogPosition) {}

    fn check_frequency(&self) -> Duration {
        DEFAULT_CHECKING_FREQUENCY
    }
}

/// Compact rendering such as `1h30m` or `250ms`.
fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms == 0 {
        return "0ms".to_string();
    }
    let hours = total_ms / 3_600_000;
    let minutes = total_ms / 60_000 % 60;
    let seconds = total_ms / 1000 % 60;
    let millis = total_ms % 1000;

    let mut out = String::new();
    for (value, unit) in [(hours, "h"), (minutes, "m"), (seconds, "s"), (millis, "ms")] {
        if value > 0 {
            let _ = write!(out, "{value}{unit}");
        }
    }
    out
}
