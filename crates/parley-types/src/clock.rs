//! Monotonic clock abstraction.
//!
//! Timeouts drive peer expiry, pending-request garbage collection, and the
//! periodic tick schedule, so the clock is a trait with a deterministic
//! manual implementation for tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of monotonic seconds.
pub trait Clock: Send + Sync {
    /// Current time in whole seconds.
    fn now_secs(&self) -> u64;

    /// Whether `timeout` seconds have elapsed since `since`.
    fn is_timeout(&self, since: u64, timeout: u64) -> bool {
        since.saturating_add(timeout) <= self.now_secs()
    }
}

/// Wall-clock seconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at `secs`.
    pub fn new(secs: u64) -> Self {
        Self {
            secs: AtomicU64::new(secs),
        }
    }

    /// Advance the clock by `secs` seconds.
    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_secs(), 100);
        clock.advance(5);
        assert_eq!(clock.now_secs(), 105);
        clock.set(50);
        assert_eq!(clock.now_secs(), 50);
    }

    #[test]
    fn test_is_timeout() {
        let clock = ManualClock::new(100);
        assert!(clock.is_timeout(90, 10));
        assert!(!clock.is_timeout(95, 10));
        assert!(clock.is_timeout(0, 0));
    }

    #[test]
    fn test_system_clock_is_nonzero() {
        assert!(SystemClock.now_secs() > 0);
    }
}
