//! Throttling of checkpoint I/O.
//!
//! Flushing the store during a checkpoint competes with foreground work for
//! disk bandwidth. The [`IoLimiter`] paces the flusher to a configured number
//! of I/O operations per second. Limits can be lifted temporarily, for
//! instance while shutting down or while a caller waits on a forced
//! checkpoint; lifting nests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Paces checkpoint I/O.
#[derive(Debug)]
pub struct IoLimiter {
    iops_limit: Option<u32>,
    disabled: AtomicUsize,
    throttled_nanos: AtomicU64,
}

impl IoLimiter {
    /// Limiter allowing `iops_limit` operations per second (`None` =
    /// unlimited).
    #[must_use]
    pub fn new(iops_limit: Option<u32>) -> Self {
        Self {
            iops_limit: iops_limit.filter(|&l| l > 0),
            disabled: AtomicUsize::new(0),
            throttled_nanos: AtomicU64::new(0),
        }
    }

    /// A limiter that never sleeps.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Whether calls to [`maybe_limit_io`](Self::maybe_limit_io) may
    /// currently sleep.
    #[must_use]
    pub fn is_limited(&self) -> bool {
        self.iops_limit.is_some() && self.disabled.load(Ordering::Acquire) == 0
    }

    /// Sleep if `recent_ios` operations since `since` exceed the configured
    /// rate.
    #[allow(clippy::cast_precision_loss)]
    pub fn maybe_limit_io(&self, recent_ios: u64, since: Instant) {
        let Some(limit) = self.iops_limit else {
            return;
        };
        if !self.is_limited() {
            return;
        }
        let budget = Duration::from_secs_f64(recent_ios as f64 / f64::from(limit));
        let elapsed = since.elapsed();
        if budget > elapsed {
            let pause = budget - elapsed;
            #[allow(clippy::cast_possible_truncation)]
            self.throttled_nanos
                .fetch_add(pause.as_nanos() as u64, Ordering::Relaxed);
            std::thread::sleep(pause);
        }
    }

    /// Lift limits until a matching [`enable_limits`](Self::enable_limits).
    pub fn disable_limits(&self) {
        self.disabled.fetch_add(1, Ordering::AcqRel);
    }

    /// Undo one [`disable_limits`](Self::disable_limits).
    pub fn enable_limits(&self) {
        let _ = self
            .disabled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Total time spent sleeping.
    #[must_use]
    pub fn throttled(&self) -> Duration {
        Duration::from_nanos(self.throttled_nanos.load(Ordering::Relaxed))
    }

    /// Lift limits for the lifetime of the returned guard.
    #[must_use]
    pub fn unlimited_scope(&self) -> UnlimitedScope<'_> {
        self.disable_limits();
        UnlimitedScope { limiter: self }
    }
}

impl Default for IoLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Restores limits when dropped.
#[derive(Debug)]
pub struct UnlimitedScope<'a> {
    limiter: &'a IoLimiter,
}

impl Drop for UnlimitedScope<'_> {
    fn drop(&mut self) {
        self.limiter.enable_limits();
    }
}
