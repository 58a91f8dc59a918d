//! Fault isolation for simulation phases.
//!
//! Every phase, maintenance job and unit of work the driver runs goes through
//! [`FaultIsolation::run`]. Failures come in two classes:
//!
//! - **Recoverable**: the work signalled a [`SuppressedFault`], either by returning
//!   it as an error or by panicking with it. The fault is recorded and the
//!   loop carries on with the next unit.
//! - **Fatal**: any other error or panic. The caller gets the cause back and is
//!   expected to stop the server.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;

/// How many recoverable faults are kept for crash reports.
pub const RECENT_FAULT_HISTORY: usize = 16;

/// The signal for a known, non-corrupting instability.
///
/// Simulation code returns this (or panics with it) when it hits a state it
/// knows how to abandon safely, for example an update chain that recursed too
/// deep. The tick loop survives it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("suppressed simulation fault: {reason}")]
pub struct SuppressedFault {
    /// What was suppressed.
    pub reason: String,
}

impl SuppressedFault {
    /// Creates a new suppressed fault.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Unwinds out of the current phase with this fault as the panic payload.
    ///
    /// Useful deep inside code that has no `Result` to return through.
    pub fn raise(reason: impl Into<String>) -> ! {
        panic::panic_any(Self::new(reason))
    }
}

/// Whether a fault stopped the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    /// Recorded and skipped.
    Recoverable,
    /// Terminates the tick loop.
    Fatal,
}

/// A single failure observed by [`FaultIsolation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    /// Name of the phase or job that failed.
    pub phase: String,
    /// The unit (world) the phase was running for, if any.
    pub unit: Option<String>,
    /// The tick being executed.
    pub tick: u64,
    /// The cause, with its full context chain.
    pub cause: String,
    /// Recoverable or fatal.
    pub class: FaultClass,
}

impl FaultRecord {
    /// Returns `true` if this fault stops the server.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.class == FaultClass::Fatal
    }

    /// Short operator-facing message for a recoverable fault.
    #[must_use]
    pub fn notice(&self) -> String {
        match &self.unit {
            Some(unit) => format!("Suppressed a crash in {} for {unit}: {}", self.phase, self.cause),
            None => format!("Suppressed a crash in {}: {}", self.phase, self.cause),
        }
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (tick {}", self.phase, self.tick)?;
        if let Some(unit) = &self.unit {
            write!(f, ", {unit}")?;
        }
        write!(f, "): {}", self.cause)
    }
}

/// A fatal failure together with its original error.
#[derive(Debug)]
pub struct Failure {
    /// What happened.
    pub record: FaultRecord,
    /// The error (or converted panic) that caused it.
    pub error: anyhow::Error,
}

/// Result of running one piece of work under isolation.
#[derive(Debug)]
pub enum PhaseOutcome {
    /// The work finished normally.
    Completed,
    /// The work hit a suppressed fault; the loop should continue.
    Recovered(FaultRecord),
    /// The work failed in a way the server cannot survive.
    Fatal(Failure),
}

/// Where a piece of work runs, for fault records.
#[derive(Debug, Clone, Copy)]
pub struct FaultScope<'a> {
    /// Phase or job name.
    pub phase: &'a str,
    /// Unit name, if the work is per unit.
    pub unit: Option<&'a str>,
    /// Tick being executed.
    pub tick: u64,
}

/// Runs work and classifies its failures.
#[derive(Debug, Default)]
pub struct FaultIsolation {
    recent: VecDeque<FaultRecord>,
    recovered_total: u64,
}

impl FaultIsolation {
    /// Creates an isolation boundary with an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work`, catching both returned errors and panics.
    pub fn run<F>(&mut self, scope: FaultScope<'_>, work: F) -> PhaseOutcome
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        let (error, suppressed) = match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(())) => return PhaseOutcome::Completed,
            Ok(Err(error)) => {
                let suppressed = error.chain().any(|cause| cause.is::<SuppressedFault>());
                (error, suppressed)
            }
            Err(payload) => match payload.downcast::<SuppressedFault>() {
                Ok(fault) => (anyhow::Error::new(*fault), true),
                Err(payload) => (
                    anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref())),
                    false,
                ),
            },
        };

        let record = FaultRecord {
            phase: scope.phase.to_owned(),
            unit: scope.unit.map(str::to_owned),
            tick: scope.tick,
            cause: format!("{error:#}"),
            class: if suppressed {
                FaultClass::Recoverable
            } else {
                FaultClass::Fatal
            },
        };

        if suppressed {
            log::warn!("Recovered from fault in {record}");
            self.recovered_total += 1;
            if self.recent.len() == RECENT_FAULT_HISTORY {
                self.recent.pop_front();
            }
            self.recent.push_back(record.clone());
            PhaseOutcome::Recovered(record)
        } else {
            PhaseOutcome::Fatal(Failure { record, error })
        }
    }

    /// The most recent recoverable faults, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &FaultRecord> {
        self.recent.iter()
    }

    /// Number of recoverable faults seen since creation.
    #[must_use]
    pub fn recovered_total(&self) -> u64 {
        self.recovered_total
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(fault) = payload.downcast_ref::<SuppressedFault>() {
        fault.to_string()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    fn scope(phase: &str) -> FaultScope<'_> {
        FaultScope {
            phase,
            unit: Some("overworld"),
            tick: 7,
        }
    }

    #[test]
    fn test_completed() {
        let mut isolation = FaultIsolation::new();
        let outcome = isolation.run(scope("tick world"), || Ok(()));
        assert!(matches!(outcome, PhaseOutcome::Completed));
        assert_eq!(isolation.recovered_total(), 0);
    }

    #[test]
    fn test_returned_suppression_is_recoverable() {
        let mut isolation = FaultIsolation::new();
        let outcome = isolation.run(scope("tick world"), || {
            Err(SuppressedFault::new("update depth exceeded")).context("ticking redstone")
        });
        let PhaseOutcome::Recovered(record) = outcome else {
            panic!("expected a recoverable fault, got {outcome:?}");
        };
        assert!(!record.is_fatal());
        assert_eq!(record.unit.as_deref(), Some("overworld"));
        assert!(record.cause.contains("update depth exceeded"));
        assert!(record.notice().contains("tick world"));
        assert_eq!(isolation.recent().count(), 1);
    }

    #[test]
    fn test_panicked_suppression_is_recoverable() {
        let mut isolation = FaultIsolation::new();
        let outcome = isolation.run(scope("update entities"), || {
            SuppressedFault::raise("entity removed twice")
        });
        assert!(matches!(outcome, PhaseOutcome::Recovered(_)));
    }

    #[test]
    fn test_other_errors_are_fatal() {
        let mut isolation = FaultIsolation::new();
        let outcome = isolation.run(scope("tick world"), || anyhow::bail!("corrupt section"));
        let PhaseOutcome::Fatal(failure) = outcome else {
            panic!("expected a fatal fault, got {outcome:?}");
        };
        assert!(failure.record.is_fatal());
        assert_eq!(failure.record.cause, "corrupt section");

        let outcome = isolation.run(scope("tick world"), || panic!("index out of bounds"));
        let PhaseOutcome::Fatal(failure) = outcome else {
            panic!("expected a fatal fault, got {outcome:?}");
        };
        assert_eq!(failure.record.cause, "panicked: index out of bounds");
        assert_eq!(isolation.recent().count(), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut isolation = FaultIsolation::new();
        for i in 0..(RECENT_FAULT_HISTORY + 4) {
            isolation.run(scope("tick world"), || {
                Err(SuppressedFault::new(format!("fault {i}")).into())
            });
        }
        assert_eq!(isolation.recent().count(), RECENT_FAULT_HISTORY);
        assert_eq!(isolation.recovered_total(), (RECENT_FAULT_HISTORY + 4) as u64);
        let oldest = isolation.recent().next().expect("history is not empty");
        assert!(oldest.cause.contains("fault 4"));
    }
}
