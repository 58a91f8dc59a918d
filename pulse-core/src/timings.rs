//! Rolling tick duration statistics.

use std::time::Duration;

use serde::Serialize;

/// Number of ticks kept in the rolling window.
pub const SAMPLE_WINDOW: usize = 100;

/// Durations of the most recent ticks.
#[derive(Debug, Clone)]
pub struct TickTimings {
    samples: [Duration; SAMPLE_WINDOW],
    next: usize,
    filled: usize,
}

/// A point-in-time view of [`TickTimings`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimingSummary {
    /// Average milliseconds per tick.
    pub mspt: f64,
    /// Estimated ticks per second, never above the target rate.
    pub tps: f64,
    /// Median tick time in milliseconds.
    pub p50: f64,
    /// 95th percentile tick time in milliseconds.
    pub p95: f64,
    /// 99th percentile tick time in milliseconds.
    pub p99: f64,
    /// Number of samples the figures are based on.
    pub samples: usize,
}

impl TickTimings {
    /// Creates an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: [Duration::ZERO; SAMPLE_WINDOW],
            next: 0,
            filled: 0,
        }
    }

    /// Records how long a tick took.
    pub fn record(&mut self, duration: Duration) {
        self.samples[self.next] = duration;
        self.next = (self.next + 1) % SAMPLE_WINDOW;
        self.filled = (self.filled + 1).min(SAMPLE_WINDOW);
    }

    fn recorded(&self) -> &[Duration] {
        &self.samples[..self.filled]
    }

    /// Number of samples currently in the window.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.filled
    }

    /// Average tick time in milliseconds, 0 when nothing was recorded.
    #[must_use]
    pub fn average_mspt(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        let total: Duration = self.recorded().iter().sum();
        total.as_secs_f64() * 1000.0 / self.filled as f64
    }

    /// Nearest-rank percentile of tick time in milliseconds.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        let mut sorted = self.recorded().to_vec();
        sorted.sort_unstable();
        let rank = (percentile.clamp(0.0, 100.0) / 100.0 * self.filled as f64).ceil() as usize;
        let index = rank.clamp(1, self.filled) - 1;
        sorted[index].as_secs_f64() * 1000.0
    }

    /// Ticks per second the server manages, capped at `target_rate`.
    #[must_use]
    pub fn tps(&self, target_rate: f32) -> f64 {
        let mspt = self.average_mspt();
        let target = f64::from(target_rate);
        if mspt <= 0.0 {
            return target;
        }
        (1000.0 / mspt).min(target)
    }

    /// Summarizes the window.
    #[must_use]
    pub fn summary(&self, target_rate: f32) -> TimingSummary {
        TimingSummary {
            mspt: self.average_mspt(),
            tps: self.tps(target_rate),
            p50: self.percentile(50.0),
            p95: self.percentile(95.0),
            p99: self.percentile(99.0),
            samples: self.filled,
        }
    }
}

impl Default for TickTimings {
    fn default() -> Self {
        Self::new()
    }
}
