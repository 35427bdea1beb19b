//! Wall-clock source for share timestamps.
//!
//! All timestamps are Unix seconds. The registry reads time through the
//! [`Clock`] trait so expiry can be exercised without sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds in one hour.
pub const SECS_PER_HOUR: i64 = 3600;

/// A source of the current Unix time in seconds.
pub trait Clock: Send + Sync {
    /// Returns the current Unix time in seconds.
    fn now(&self) -> i64;
}

/// Clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock, for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Moves the clock forward by `secs`.
    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Moves the clock forward by whole hours.
    pub fn advance_hours(&self, hours: i64) {
        self.advance(hours * SECS_PER_HOUR);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
