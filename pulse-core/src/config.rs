//! Tick loop configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lowest accepted tick rate.
pub const MIN_TICK_RATE: f32 = 0.1;
/// Highest accepted tick rate.
pub const MAX_TICK_RATE: f32 = 10_000.0;

/// A configuration value outside its accepted range.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// `tick_rate` is not within [`MIN_TICK_RATE`]..=[`MAX_TICK_RATE`].
    #[error("tick rate must be in range {MIN_TICK_RATE}..={MAX_TICK_RATE}, got {0}")]
    TickRate(f32),
    /// The stall clamp is shorter than a single tick.
    #[error("stall clamp ({clamp_ms} ms) must be at least one tick period ({period_ms} ms)")]
    StallClamp {
        /// Configured clamp.
        clamp_ms: u64,
        /// Tick period derived from the tick rate.
        period_ms: u64,
    },
    /// The minimum yield is zero.
    #[error("minimum yield must be at least 1 ms")]
    MinYield,
}

/// Settings for the tick driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Target ticks per second.
    pub tick_rate: f32,
    /// Longest stall, in milliseconds, the loop tries to make up for at once.
    pub stall_clamp_ms: u64,
    /// Minimum time between two stall clamps (and their warnings).
    pub stall_warning_cooldown_ms: u64,
    /// Shortest sleep at the end of a cycle.
    pub min_yield_ms: u64,
    /// Refresh the liveness timestamp between catch-up ticks.
    pub watchdog_fix: bool,
    /// Run at most one tick per cycle instead of catching up on missed ticks.
    pub disable_catch_up: bool,
    /// Ticks between autosaves, 0 disables.
    pub autosave_interval: u64,
    /// Ticks between status refreshes, 0 disables.
    pub status_interval: u64,
    /// Ticks between statistics log lines, 0 disables.
    pub stats_interval: u64,
    /// Where crash reports are written.
    pub crash_report_dir: PathBuf,
}

impl TickConfig {
    /// Checks every value is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_TICK_RATE..=MAX_TICK_RATE).contains(&self.tick_rate) {
            return Err(ConfigError::TickRate(self.tick_rate));
        }
        let period = self.tick_period();
        if Duration::from_millis(self.stall_clamp_ms) < period {
            return Err(ConfigError::StallClamp {
                clamp_ms: self.stall_clamp_ms,
                period_ms: period.as_millis() as u64,
            });
        }
        if self.min_yield_ms == 0 {
            return Err(ConfigError::MinYield);
        }
        Ok(())
    }

    /// Duration of one tick at the configured rate.
    #[must_use]
    pub fn tick_period(&self) -> Duration {
        tick_period(self.tick_rate)
    }

    /// The stall clamp as a duration.
    #[must_use]
    pub fn stall_clamp(&self) -> Duration {
        Duration::from_millis(self.stall_clamp_ms)
    }

    /// The stall warning cooldown as a duration.
    #[must_use]
    pub fn stall_warning_cooldown(&self) -> Duration {
        Duration::from_millis(self.stall_warning_cooldown_ms)
    }

    /// The minimum yield as a duration.
    #[must_use]
    pub fn min_yield(&self) -> Duration {
        Duration::from_millis(self.min_yield_ms)
    }
}

/// Duration of one tick at `tick_rate` ticks per second.
#[must_use]
pub fn tick_period(tick_rate: f32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(tick_rate))
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20.0,
            stall_clamp_ms: 2000,
            stall_warning_cooldown_ms: 15_000,
            min_yield_ms: 1,
            watchdog_fix: true,
            disable_catch_up: false,
            autosave_interval: 900,
            status_interval: 100,
            stats_interval: 6000,
            crash_report_dir: PathBuf::from("crash-reports"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = TickConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.tick_period(), Duration::from_millis(50));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let config = TickConfig {
            tick_rate: 0.0,
            ..TickConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::TickRate(0.0)));

        let config = TickConfig {
            tick_rate: 1.0,
            stall_clamp_ms: 500,
            ..TickConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::StallClamp { .. })));

        let config = TickConfig {
            min_yield_ms: 0,
            ..TickConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MinYield));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: TickConfig =
            serde_json::from_str(r#"{ "tick_rate": 40.0, "watchdog_fix": false }"#)
                .expect("valid config");
        assert_eq!(config.tick_period(), Duration::from_millis(25));
        assert!(!config.watchdog_fix);
        assert!(!config.disable_catch_up);
        assert_eq!(config.autosave_interval, 900);
    }
}
