//! Recurring jobs driven by the tick counter.
//!
//! Intervals are counted in ticks, not wall time, so a warp runs autosaves
//! at the same cadence relative to simulated time as normal play does.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::driver::{DriverState, StatusSnapshot};
use crate::fault::{Failure, FaultIsolation, FaultRecord, FaultScope, PhaseOutcome};
use crate::timings::TickTimings;

/// What happens when a job fails with a fatal fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failure and keep running. Used for persistence.
    Log,
    /// Stop the server.
    Fatal,
}

/// Driver state visible to maintenance jobs.
pub struct MaintenanceContext<'a> {
    /// The tick being executed.
    pub tick: u64,
    /// Configured ticks per second.
    pub tick_rate: f32,
    /// Current driver state.
    pub state: DriverState,
    /// Recent tick timings.
    pub timings: &'a TickTimings,
    /// Where status snapshots are published.
    pub status: &'a ArcSwap<StatusSnapshot>,
}

impl MaintenanceContext<'_> {
    /// Publishes a fresh status snapshot.
    pub fn publish_status(&self, session_count: usize) {
        let summary = self.timings.summary(self.tick_rate);
        self.status.store(Arc::new(StatusSnapshot {
            tick: self.tick,
            state: self.state,
            tick_rate: self.tick_rate,
            mspt: summary.mspt,
            tps: summary.tps,
            session_count,
        }));
    }
}

type JobAction<S> = Box<dyn FnMut(&mut S, &MaintenanceContext<'_>) -> anyhow::Result<()> + Send>;

/// A registered recurring job.
pub struct MaintenanceJob<S> {
    name: &'static str,
    interval_ticks: u64,
    last_run_tick: u64,
    policy: FailurePolicy,
    action: JobAction<S>,
}

impl<S> MaintenanceJob<S> {
    /// The job's name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ticks between runs, 0 if disabled.
    #[must_use]
    pub fn interval_ticks(&self) -> u64 {
        self.interval_ticks
    }

    /// The tick the job last ran on, or the tick counting started from.
    #[must_use]
    pub fn last_run_tick(&self) -> u64 {
        self.last_run_tick
    }

    fn is_due(&self, tick: u64) -> bool {
        self.interval_ticks > 0 && tick.saturating_sub(self.last_run_tick) >= self.interval_ticks
    }
}

/// Runs registered jobs when their interval has elapsed.
pub struct MaintenanceScheduler<S> {
    jobs: Vec<MaintenanceJob<S>>,
    origin_tick: u64,
}

impl<S> MaintenanceScheduler<S> {
    /// Creates a scheduler with no jobs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            origin_tick: 0,
        }
    }

    /// Counts every interval from `tick`, for a loop resuming a saved tick counter.
    ///
    /// Jobs registered later also start counting from `tick`.
    pub fn rebase(&mut self, tick: u64) {
        self.origin_tick = tick;
        for job in &mut self.jobs {
            job.last_run_tick = tick;
        }
    }

    /// Registers a job running every `interval_ticks` ticks.
    ///
    /// An interval of 0 registers the job disabled. Jobs run in registration order.
    pub fn register<F>(
        &mut self,
        name: &'static str,
        interval_ticks: u64,
        policy: FailurePolicy,
        action: F,
    ) where
        F: FnMut(&mut S, &MaintenanceContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        if interval_ticks == 0 {
            log::debug!("Maintenance job '{name}' is disabled");
        }
        self.jobs.push(MaintenanceJob {
            name,
            interval_ticks,
            last_run_tick: self.origin_tick,
            policy,
            action: Box::new(action),
        });
    }

    /// Registered jobs in run order.
    pub fn jobs(&self) -> impl Iterator<Item = &MaintenanceJob<S>> {
        self.jobs.iter()
    }

    /// Runs every job due at `ctx.tick`.
    ///
    /// A job that ran is not due again until `interval_ticks` after this tick,
    /// so calling this twice for the same tick runs nothing the second time.
    /// Returns the recoverable faults raised, or the first fatal one from a
    /// [`FailurePolicy::Fatal`] job.
    pub fn run_due(
        &mut self,
        sim: &mut S,
        ctx: &MaintenanceContext<'_>,
        faults: &mut FaultIsolation,
    ) -> Result<Vec<FaultRecord>, Failure> {
        let mut recovered = Vec::new();
        for job in &mut self.jobs {
            if !job.is_due(ctx.tick) {
                continue;
            }
            job.last_run_tick = ctx.tick;

            let scope = FaultScope {
                phase: job.name,
                unit: None,
                tick: ctx.tick,
            };
            let action = &mut job.action;
            match faults.run(scope, || action(sim, ctx)) {
                PhaseOutcome::Completed => {}
                PhaseOutcome::Recovered(record) => recovered.push(record),
                PhaseOutcome::Fatal(failure) => match job.policy {
                    FailurePolicy::Log => {
                        log::error!(
                            "Maintenance job '{}' failed: {:#}",
                            job.name,
                            failure.error
                        );
                    }
                    FailurePolicy::Fatal => return Err(failure),
                },
            }
        }
        Ok(recovered)
    }
}

impl<S> Default for MaintenanceScheduler<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::fault::SuppressedFault;

    use super::*;

    #[derive(Default)]
    struct Counters {
        autosaves: Vec<u64>,
        stats: u32,
    }

    fn run(
        scheduler: &mut MaintenanceScheduler<Counters>,
        counters: &mut Counters,
        faults: &mut FaultIsolation,
        tick: u64,
    ) -> Result<Vec<FaultRecord>, Failure> {
        let timings = TickTimings::new();
        let status = ArcSwap::from_pointee(StatusSnapshot::default());
        let ctx = MaintenanceContext {
            tick,
            tick_rate: 20.0,
            state: DriverState::Running,
            timings: &timings,
            status: &status,
        };
        scheduler.run_due(counters, &ctx, faults)
    }

    #[test]
    fn test_fires_on_interval_boundaries() {
        let mut scheduler = MaintenanceScheduler::new();
        scheduler.register("autosave", 900, FailurePolicy::Log, |c: &mut Counters, ctx| {
            c.autosaves.push(ctx.tick);
            Ok(())
        });

        let mut counters = Counters::default();
        let mut faults = FaultIsolation::new();
        for tick in 1..=2700 {
            run(&mut scheduler, &mut counters, &mut faults, tick).expect("no fatal faults");
        }
        assert_eq!(counters.autosaves, vec![900, 1800, 2700]);
    }

    #[test]
    fn test_same_tick_twice_fires_once() {
        let mut scheduler = MaintenanceScheduler::new();
        scheduler.register("autosave", 900, FailurePolicy::Log, |c: &mut Counters, ctx| {
            c.autosaves.push(ctx.tick);
            Ok(())
        });

        let mut counters = Counters::default();
        let mut faults = FaultIsolation::new();
        run(&mut scheduler, &mut counters, &mut faults, 900).expect("ok");
        run(&mut scheduler, &mut counters, &mut faults, 900).expect("ok");
        assert_eq!(counters.autosaves, vec![900]);
    }

    #[test]
    fn test_stall_does_not_compound() {
        let mut scheduler = MaintenanceScheduler::new();
        scheduler.register("autosave", 100, FailurePolicy::Log, |c: &mut Counters, ctx| {
            c.autosaves.push(ctx.tick);
            Ok(())
        });

        let mut counters = Counters::default();
        let mut faults = FaultIsolation::new();
        // Skipping ahead fires once, then the cadence restarts from there
        run(&mut scheduler, &mut counters, &mut faults, 350).expect("ok");
        run(&mut scheduler, &mut counters, &mut faults, 400).expect("ok");
        run(&mut scheduler, &mut counters, &mut faults, 450).expect("ok");
        assert_eq!(counters.autosaves, vec![350, 450]);
    }

    #[test]
    fn test_rebase_counts_from_resumed_tick() {
        let mut scheduler = MaintenanceScheduler::new();
        scheduler.register("autosave", 900, FailurePolicy::Log, |c: &mut Counters, ctx| {
            c.autosaves.push(ctx.tick);
            Ok(())
        });
        scheduler.rebase(5000);
        scheduler.register("stats", 100, FailurePolicy::Log, |c: &mut Counters, _| {
            c.stats += 1;
            Ok(())
        });

        let mut counters = Counters::default();
        let mut faults = FaultIsolation::new();
        for tick in 5001..=5900 {
            run(&mut scheduler, &mut counters, &mut faults, tick).expect("no fatal faults");
        }
        assert_eq!(counters.autosaves, vec![5900]);
        assert_eq!(counters.stats, 9);
    }

    #[test]
    fn test_registration_order_and_disabled_jobs() {
        let order = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut scheduler = MaintenanceScheduler::new();
        for name in ["first", "second"] {
            let order = std::sync::Arc::clone(&order);
            scheduler.register(name, 10, FailurePolicy::Log, move |_: &mut Counters, _| {
                order.lock().push(name);
                Ok(())
            });
        }
        scheduler.register("never", 0, FailurePolicy::Fatal, |c: &mut Counters, _| {
            c.stats += 1;
            Ok(())
        });

        let mut counters = Counters::default();
        let mut faults = FaultIsolation::new();
        run(&mut scheduler, &mut counters, &mut faults, 10).expect("ok");
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(counters.stats, 0);
        assert_eq!(scheduler.jobs().count(), 3);
    }

    #[test]
    fn test_failure_policies() {
        let mut scheduler = MaintenanceScheduler::new();
        scheduler.register("autosave", 1, FailurePolicy::Log, |_: &mut Counters, _| {
            anyhow::bail!("disk full")
        });
        scheduler.register("suppressed", 1, FailurePolicy::Fatal, |_: &mut Counters, _| {
            Err(SuppressedFault::new("known glitch").into())
        });
        scheduler.register("stats", 1, FailurePolicy::Log, |c: &mut Counters, _| {
            c.stats += 1;
            Ok(())
        });

        let mut counters = Counters::default();
        let mut faults = FaultIsolation::new();
        let recovered = run(&mut scheduler, &mut counters, &mut faults, 1).expect("not fatal");
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].phase, "suppressed");
        assert_eq!(counters.stats, 1);

        scheduler.register("broken", 1, FailurePolicy::Fatal, |_: &mut Counters, _| {
            anyhow::bail!("invariant violated")
        });
        let failure = run(&mut scheduler, &mut counters, &mut faults, 2).expect_err("fatal");
        assert_eq!(failure.record.phase, "broken");
    }
}
