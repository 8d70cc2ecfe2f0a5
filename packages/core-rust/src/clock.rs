//! Injectable time source.
//!
//! Expiry checks in the drivers and token minting in the stream writer read the
//! current time through [`ClockSource`] so tests can pin or advance it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Abstraction over the system clock for dependency injection.
///
/// The default implementation ([`SystemClock`]) delegates to
/// `std::time::SystemTime`.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now(&self) -> u64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> u64 {
        // A clock set before the epoch reads as 0 rather than panicking.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying instant, so a test can hand one clone to a
/// driver and keep another to advance time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock frozen at `millis` since the epoch.
    #[must_use]
    pub fn new(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let delta = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute value.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Absolute expiry time in millis for a TTL starting at `now`.
///
/// Saturates instead of overflowing for absurdly large TTLs.
#[must_use]
pub fn expires_at(now: u64, ttl: Duration) -> u64 {
    now.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn expires_at_never_precedes_now(now in any::<u64>(), ttl_ms in any::<u64>()) {
            prop_assert!(expires_at(now, Duration::from_millis(ttl_ms)) >= now);
        }
    }

    #[test]
    fn system_clock_returns_nonzero() {
        let clock = SystemClock;
        assert!(clock.now() > 0);
    }

    #[test]
    fn manual_clock_advances_shared_state() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();

        other.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), 1_250);

        clock.set(5);
        assert_eq!(other.now(), 5);
    }

    #[test]
    fn expires_at_saturates() {
        assert_eq!(expires_at(10, Duration::from_secs(1)), 1_010);
        assert_eq!(expires_at(u64::MAX - 1, Duration::from_secs(1)), u64::MAX);
    }
}
