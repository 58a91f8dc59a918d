//! Time source used by the tick driver.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Wall-clock time and sleeping.
///
/// `now` is measured from an arbitrary origin and is allowed to move
/// backwards (the system clock can be changed under a running server).
pub trait Clock: Send + Sync {
    /// Current time since the clock's origin.
    fn now(&self) -> Duration;

    /// Suspends the calling thread.
    fn sleep(&self, duration: Duration);
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        // Before 1970 only happens on a badly misconfigured host; treat it as the origin.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// A clock that only moves when told to.
///
/// Sleeping advances the clock by the requested duration and records it.
/// Share it with `Arc` to keep a handle for the test while the driver owns a clone.
#[derive(Debug, Default)]
pub struct ManualClock {
    inner: Mutex<ManualClockState>,
}

#[derive(Debug, Default)]
struct ManualClockState {
    now: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Creates a clock starting at `start`.
    #[must_use]
    pub fn new(start: Duration) -> Self {
        Self {
            inner: Mutex::new(ManualClockState {
                now: start,
                sleeps: Vec::new(),
            }),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.inner.lock().now += by;
    }

    /// Moves the clock backward, saturating at the origin.
    pub fn rewind(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.now = inner.now.saturating_sub(by);
    }

    /// Sets the current time.
    pub fn set(&self, now: Duration) {
        self.inner.lock().now = now;
    }

    /// Returns every sleep requested so far, oldest first, and forgets them.
    pub fn take_sleeps(&self) -> Vec<Duration> {
        std::mem::take(&mut self.inner.lock().sleeps)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.inner.lock().now
    }

    fn sleep(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.now += duration;
        inner.sleeps.push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new(Duration::from_secs(10));
        clock.sleep(Duration::from_millis(50));
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now(), Duration::from_millis(10_055));
        assert_eq!(clock.take_sleeps(), vec![Duration::from_millis(50)]);
        assert!(clock.take_sleeps().is_empty());
    }

    #[test]
    fn test_manual_clock_rewind_saturates() {
        let clock = ManualClock::new(Duration::from_millis(100));
        clock.rewind(Duration::from_millis(40));
        assert_eq!(clock.now(), Duration::from_millis(60));
        clock.rewind(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn test_shared_clock() {
        let clock = Arc::new(ManualClock::default());
        let driver_side = Arc::clone(&clock);
        driver_side.sleep(Duration::from_millis(3));
        assert_eq!(clock.now(), Duration::from_millis(3));
    }
}
