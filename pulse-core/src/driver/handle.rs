//! State shared between the tick driver and the rest of the server.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::config::{ConfigError, MAX_TICK_RATE, MIN_TICK_RATE};
use crate::tasks::{TaskHandle, TaskQueue};

/// Lifecycle of the tick loop.
///
/// Transitions go `Running <-> Warping`, then `Running | Warping -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DriverState {
    /// Ticking at the configured rate.
    #[default]
    Running = 0,
    /// Ticking as fast as possible for a requested number of ticks.
    Warping = 1,
    /// Shutting down; no further ticks run.
    Stopping = 2,
    /// Shutdown has finished.
    Stopped = 3,
}

impl DriverState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Warping,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    /// Returns `true` while ticks still run.
    #[must_use]
    pub const fn is_ticking(self) -> bool {
        matches!(self, Self::Running | Self::Warping)
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Warping => "warping",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        })
    }
}

/// Errors returned by [`DriverHandle`] and driver construction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriverError {
    /// Warp was requested while the driver was not running normally.
    #[error("cannot warp while the server is {0}")]
    WarpUnavailable(DriverState),
    /// Warp was requested for zero ticks.
    #[error("warp needs at least one tick")]
    EmptyWarp,
    /// A configuration value was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Liveness timestamp for an external hang watchdog.
///
/// The driver refreshes it at the end of every cycle and between catch-up
/// ticks. The value is the driver clock's reading in milliseconds.
#[derive(Debug, Default)]
pub struct Heartbeat {
    last_alive_ms: AtomicU64,
}

impl Heartbeat {
    pub(crate) fn refresh(&self, now: Duration) {
        let millis = u64::try_from(now.as_millis()).unwrap_or(u64::MAX);
        self.last_alive_ms.store(millis, Ordering::Release);
    }

    /// The last time the loop proved it was alive.
    #[must_use]
    pub fn last_alive(&self) -> Duration {
        Duration::from_millis(self.last_alive_ms.load(Ordering::Acquire))
    }

    /// How long ago, relative to `now`, the loop was last alive.
    #[must_use]
    pub fn silent_for(&self, now: Duration) -> Duration {
        now.saturating_sub(self.last_alive())
    }
}

/// Server status, refreshed periodically by the status job.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StatusSnapshot {
    /// Tick the snapshot was taken on.
    pub tick: u64,
    /// Driver state at that tick.
    pub state: DriverState,
    /// Configured ticks per second.
    pub tick_rate: f32,
    /// Average milliseconds per tick.
    pub mspt: f64,
    /// Measured ticks per second.
    pub tps: f64,
    /// Connected sessions.
    pub session_count: usize,
}

pub(crate) struct DriverShared {
    state: AtomicU8,
    tick_count: AtomicU64,
    warp_remaining: AtomicU64,
    tick_rate_bits: AtomicU32,
    pub(crate) heartbeat: Heartbeat,
    pub(crate) status: ArcSwap<StatusSnapshot>,
}

impl DriverShared {
    pub(crate) fn new(tick_rate: f32) -> Self {
        Self {
            state: AtomicU8::new(DriverState::Running as u8),
            tick_count: AtomicU64::new(0),
            warp_remaining: AtomicU64::new(0),
            tick_rate_bits: AtomicU32::new(tick_rate.to_bits()),
            heartbeat: Heartbeat::default(),
            status: ArcSwap::from_pointee(StatusSnapshot {
                tick_rate,
                tps: f64::from(tick_rate),
                ..StatusSnapshot::default()
            }),
        }
    }

    pub(crate) fn state(&self) -> DriverState {
        DriverState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `from -> to`, failing if the state was something else.
    pub(crate) fn transition(&self, from: DriverState, to: DriverState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves any ticking state to `Stopping`. Returns `false` if already stopping.
    pub(crate) fn begin_stop(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                DriverState::from_u8(raw)
                    .is_ticking()
                    .then_some(DriverState::Stopping as u8)
            })
            .is_ok()
    }

    pub(crate) fn mark_stopped(&self) {
        self.state
            .store(DriverState::Stopped as u8, Ordering::Release);
    }

    pub(crate) fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_tick_count(&self, tick: u64) {
        self.tick_count.store(tick, Ordering::Release);
    }

    pub(crate) fn tick_rate(&self) -> f32 {
        f32::from_bits(self.tick_rate_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn warp_remaining(&self) -> u64 {
        self.warp_remaining.load(Ordering::Acquire)
    }

    /// Takes one tick off the warp budget, returning what was left before.
    pub(crate) fn consume_warp_tick(&self) -> Option<u64> {
        self.warp_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                left.checked_sub(1)
            })
            .ok()
    }
}

/// Cloneable control surface for a running [`TickDriver`](super::TickDriver).
#[derive(Clone)]
pub struct DriverHandle {
    pub(crate) shared: Arc<DriverShared>,
    pub(crate) tasks: Arc<TaskQueue>,
}

impl DriverHandle {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DriverState {
        self.shared.state()
    }

    /// Number of ticks completed.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.shared.tick_count()
    }

    /// Asks the loop to stop after the tick in progress.
    ///
    /// Returns `false` if the server was already stopping or stopped.
    pub fn request_stop(&self) -> bool {
        let accepted = self.shared.begin_stop();
        if accepted {
            log::info!("Stop requested at tick {}", self.tick_count());
        }
        accepted
    }

    /// Runs the next `ticks` ticks back to back without sleeping.
    ///
    /// # Errors
    /// Fails if `ticks` is 0 or the server is not in [`DriverState::Running`].
    pub fn request_warp(&self, ticks: u64) -> Result<(), DriverError> {
        if ticks == 0 {
            return Err(DriverError::EmptyWarp);
        }
        // The budget goes in first so the driver never sees Warping with nothing to do.
        if self
            .shared
            .warp_remaining
            .compare_exchange(0, ticks, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DriverError::WarpUnavailable(self.state()));
        }
        if self
            .shared
            .transition(DriverState::Running, DriverState::Warping)
        {
            Ok(())
        } else {
            self.shared.warp_remaining.store(0, Ordering::Release);
            Err(DriverError::WarpUnavailable(self.state()))
        }
    }

    /// Ends a warp early. The driver returns to normal pacing on its next cycle.
    ///
    /// Returns `false` if no warp was in progress.
    pub fn cancel_warp(&self) -> bool {
        if self.state() != DriverState::Warping {
            return false;
        }
        self.shared.warp_remaining.store(0, Ordering::Release);
        true
    }

    /// Ticks left in the current warp.
    #[must_use]
    pub fn warp_remaining(&self) -> u64 {
        self.shared.warp_remaining()
    }

    /// Configured ticks per second.
    #[must_use]
    pub fn tick_rate(&self) -> f32 {
        self.shared.tick_rate()
    }

    /// Changes the target tick rate, effective from the next cycle.
    ///
    /// # Errors
    /// Fails if `rate` is outside [`MIN_TICK_RATE`]..=[`MAX_TICK_RATE`].
    pub fn set_tick_rate(&self, rate: f32) -> Result<(), DriverError> {
        if !(MIN_TICK_RATE..=MAX_TICK_RATE).contains(&rate) {
            return Err(ConfigError::TickRate(rate).into());
        }
        self.shared
            .tick_rate_bits
            .store(rate.to_bits(), Ordering::Relaxed);
        log::info!("Tick rate set to {rate}");
        Ok(())
    }

    /// Submits work to run on the simulation thread. See [`TaskQueue::submit`].
    pub fn submit<F, T>(&self, work: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.tasks.submit(work)
    }

    /// The queue tasks are submitted to.
    #[must_use]
    pub fn tasks(&self) -> &Arc<TaskQueue> {
        &self.tasks
    }

    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> Arc<StatusSnapshot> {
        self.shared.status.load_full()
    }

    /// The loop's liveness timestamp.
    #[must_use]
    pub fn heartbeat(&self) -> &Heartbeat {
        &self.shared.heartbeat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> DriverHandle {
        DriverHandle {
            shared: Arc::new(DriverShared::new(20.0)),
            tasks: Arc::new(TaskQueue::new()),
        }
    }

    #[test]
    fn test_warp_lifecycle() {
        let handle = handle();
        assert_eq!(handle.request_warp(0), Err(DriverError::EmptyWarp));

        handle.request_warp(100).expect("warp accepted");
        assert_eq!(handle.state(), DriverState::Warping);
        assert_eq!(handle.warp_remaining(), 100);

        // A second warp does not clobber the first
        assert_eq!(
            handle.request_warp(5),
            Err(DriverError::WarpUnavailable(DriverState::Warping))
        );
        assert_eq!(handle.warp_remaining(), 100);

        assert!(handle.cancel_warp());
        assert_eq!(handle.warp_remaining(), 0);
        assert_eq!(handle.shared.consume_warp_tick(), None);
    }

    #[test]
    fn test_stop_is_terminal() {
        let handle = handle();
        assert!(handle.request_stop());
        assert!(!handle.request_stop());
        assert_eq!(handle.state(), DriverState::Stopping);
        assert!(matches!(
            handle.request_warp(10),
            Err(DriverError::WarpUnavailable(DriverState::Stopping))
        ));
        assert_eq!(handle.warp_remaining(), 0);
        assert!(!handle.cancel_warp());
    }

    #[test]
    fn test_tick_rate_bounds() {
        let handle = handle();
        handle.set_tick_rate(40.0).expect("valid rate");
        assert!((handle.tick_rate() - 40.0).abs() < f32::EPSILON);
        assert!(handle.set_tick_rate(0.0).is_err());
        assert!(handle.set_tick_rate(20_000.0).is_err());
        assert!((handle.tick_rate() - 40.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_heartbeat() {
        let handle = handle();
        handle.shared.heartbeat.refresh(Duration::from_millis(1500));
        assert_eq!(handle.heartbeat().last_alive(), Duration::from_millis(1500));
        assert_eq!(
            handle.heartbeat().silent_for(Duration::from_millis(4000)),
            Duration::from_millis(2500)
        );
    }
}
