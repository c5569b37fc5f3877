//! Injectable wall clock.

#![allow(missing_docs)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Source of "now" for cache freshness and window anchoring.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Seconds since the Unix epoch; times before the epoch clamp to 0.
    fn now_secs(&self) -> i64 {
        unix_secs(self.now())
    }
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<SystemTime>,
}

impl FixedClock {
    #[must_use]
    pub fn at_secs(secs: i64) -> Self {
        let offset = Duration::from_secs(secs.max(0).unsigned_abs());
        Self {
            now: Mutex::new(UNIX_EPOCH + offset),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

#[must_use]
pub fn unix_secs(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::at_secs(1_700_000_000);
        assert_eq!(clock.now_secs(), 1_700_000_000);
        clock.advance(Duration::from_secs(3_601));
        assert_eq!(clock.now_secs(), 1_700_003_601);
    }

    #[test]
    fn pre_epoch_clamps_to_zero() {
        assert_eq!(unix_secs(UNIX_EPOCH - Duration::from_secs(5)), 0);
    }
}
