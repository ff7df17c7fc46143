//! Time sources.

use std::time::Instant;

use chrono::{DateTime, Utc};

/// Monotonic and wall clock time.
pub trait Clock: Send + Sync {
    /// Monotonic nanoseconds since an arbitrary origin.
    fn nanos(&self) -> u64;

    /// Current wall clock time.
    fn wall(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose monotonic origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
