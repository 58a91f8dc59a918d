//! Detects a tick loop that has stopped making progress.

use std::time::Duration;

use pulse_core::{Clock, DriverHandle, SystemClock};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Returns how long the loop has been silent if that exceeds `max_tick_time`.
///
/// A stopping or stopped loop is never considered hung, and a zero
/// `max_tick_time` disables the check.
#[must_use]
pub fn check(handle: &DriverHandle, now: Duration, max_tick_time: Duration) -> Option<Duration> {
    if max_tick_time.is_zero() || !handle.state().is_ticking() {
        return None;
    }
    let silent = handle.heartbeat().silent_for(now);
    (silent > max_tick_time).then_some(silent)
}

/// Polls the heartbeat until the loop hangs or `cancel_token` fires.
///
/// Returns the silence that tripped the watchdog, or `None` when cancelled.
pub async fn watch(
    handle: DriverHandle,
    max_tick_time: Duration,
    cancel_token: CancellationToken,
) -> Option<Duration> {
    if max_tick_time.is_zero() {
        cancel_token.cancelled().await;
        return None;
    }

    let mut poll = interval((max_tick_time / 4).clamp(Duration::from_millis(100), Duration::from_secs(5)));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => return None,
            _ = poll.tick() => {}
        }
        if let Some(silent) = check(&handle, SystemClock.now(), max_tick_time) {
            log::error!(
                "A single server tick took {:.2} seconds (should be max {:.2})",
                silent.as_secs_f64(),
                max_tick_time.as_secs_f64()
            );
            log::error!("Considering it to be crashed, server will forcibly shutdown.");
            return Some(silent);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pulse_core::{ManualClock, TickConfig, TickDriver};

    use super::*;
    use crate::realm::{Realm, World};

    fn driver(clock: Arc<ManualClock>) -> TickDriver<Realm, Arc<ManualClock>> {
        let realm = Realm::new(vec![World::new("overworld")], "unused");
        TickDriver::new(realm, clock, TickConfig::default(), Realm::phases()).expect("valid config")
    }

    #[test]
    fn test_check_trips_after_silence() {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let driver = driver(Arc::clone(&clock));
        let handle = driver.handle();
        let max = Duration::from_secs(60);

        assert_eq!(check(&handle, Duration::from_secs(150), max), None);
        assert_eq!(
            check(&handle, Duration::from_secs(161), max),
            Some(Duration::from_secs(61))
        );
        assert_eq!(check(&handle, Duration::from_secs(161), Duration::ZERO), None);
    }

    #[test]
    fn test_check_ignores_stopping_loop() {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let driver = driver(clock);
        let handle = driver.handle();
        handle.request_stop();

        assert_eq!(
            check(&handle, Duration::from_secs(1000), Duration::from_secs(60)),
            None
        );
    }

    #[test]
    fn test_cycle_feeds_heartbeat() {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let mut driver = driver(Arc::clone(&clock));
        let handle = driver.handle();
        let max = Duration::from_secs(60);

        clock.advance(Duration::from_secs(90));
        assert!(check(&handle, clock.now(), max).is_some());

        driver.cycle().expect("no fault");
        assert_eq!(check(&handle, clock.now(), max), None);
    }
}
