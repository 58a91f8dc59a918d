//! The tick loop.
//!
//! [`TickDriver`] advances a [`Simulation`] in fixed steps. Every cycle it
//! measures how much wall time passed since the previous cycle, adds that to a
//! debt, and runs one tick per whole tick period of debt. Long stalls are
//! clamped so the loop does not try to replay minutes of missed ticks, and a
//! clock that jumps backwards counts as no time at all.
//!
//! A tick runs, in order:
//! 1. the tasks other threads queued on the [`TaskQueue`],
//! 2. every [`Phase`], per-unit phases once for each unit,
//! 3. due maintenance jobs (autosave, status, statistics and user jobs).
//!
//! Each phase invocation runs under [`FaultIsolation`]. A recoverable fault
//! skips that invocation and tells operators; anything else writes a crash
//! report and stops the loop.

mod handle;
mod phase;

pub(crate) use handle::DriverShared;
pub use handle::{DriverError, DriverHandle, DriverState, Heartbeat, StatusSnapshot};
pub(crate) use phase::PhaseFn;
pub use phase::{Phase, PhaseContext, PhaseScope, Simulation};

use std::error::Error;
use std::fmt::{self, Write as _};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::config::{TickConfig, tick_period};
use crate::crash::{CrashReport, CrashReporter};
use crate::fault::{
    Failure, FaultIsolation, FaultRecord, FaultScope, PhaseOutcome, panic_message,
};
use crate::maintenance::{FailurePolicy, MaintenanceContext, MaintenanceScheduler};
use crate::tasks::TaskQueue;
use crate::timings::TickTimings;

/// What a single [`TickDriver::cycle`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleReport {
    /// Ticks executed this cycle.
    pub ticks_run: u32,
    /// The loop ran more than one tick back to back to catch up.
    pub falling_behind: bool,
    /// The elapsed time was cut down to the stall clamp.
    pub stall_clamped: bool,
    /// How long the cycle slept at the end.
    pub slept: Duration,
    /// Set on the cycle that ended a warp.
    pub warp_finished: Option<WarpSummary>,
}

/// How a warp went, measured on the driver's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarpSummary {
    /// Ticks asked for.
    pub requested: u64,
    /// Ticks actually run, fewer if cancelled.
    pub ticks: u64,
    /// Time the warp took.
    pub elapsed: Duration,
}

/// The error that killed the tick loop.
#[derive(Debug)]
pub struct FatalFault {
    /// Where and when it happened.
    pub record: FaultRecord,
    /// The original error.
    pub error: anyhow::Error,
    /// The crash report assembled for it.
    pub report: Box<CrashReport>,
    /// Where the report was saved, if saving worked.
    pub report_path: Option<PathBuf>,
}

impl fmt::Display for FatalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal fault in {}", self.record)
    }
}

impl Error for FatalFault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        let source: &(dyn Error + 'static) = self.error.as_ref();
        Some(source)
    }
}

struct WarpProgress {
    requested: u64,
    start_tick: u64,
    started: Duration,
}

/// Paces and executes ticks for a simulation.
pub struct TickDriver<S, C = SystemClock> {
    sim: S,
    clock: C,
    config: TickConfig,
    phases: Vec<Phase<S>>,
    maintenance: MaintenanceScheduler<S>,
    faults: FaultIsolation,
    timings: TickTimings,
    reporter: CrashReporter,
    shared: Arc<DriverShared>,
    tasks: Arc<TaskQueue>,

    last_tick_wall_time: Duration,
    accumulated_debt: Duration,
    last_stall_clamp: Option<Duration>,
    warned_backwards: bool,
    warp: Option<WarpProgress>,
    profiler_position: String,
}

impl<S, C> TickDriver<S, C>
where
    S: Simulation + 'static,
    C: Clock,
{
    /// Creates a driver running `phases` against `sim` in the given order.
    ///
    /// The autosave, status and statistics jobs are registered first, with
    /// the intervals from `config`.
    ///
    /// # Errors
    /// Fails if `config` does not validate.
    pub fn new(
        sim: S,
        clock: C,
        config: TickConfig,
        phases: Vec<Phase<S>>,
    ) -> Result<Self, DriverError> {
        config.validate()?;

        let now = clock.now();
        let shared = Arc::new(DriverShared::new(config.tick_rate));
        shared.heartbeat.refresh(now);

        let mut maintenance = MaintenanceScheduler::new();
        register_builtin_jobs(&mut maintenance, &config);

        Ok(Self {
            sim,
            clock,
            reporter: CrashReporter::new(config.crash_report_dir.clone()),
            config,
            phases,
            maintenance,
            faults: FaultIsolation::new(),
            timings: TickTimings::new(),
            shared,
            tasks: Arc::new(TaskQueue::new()),
            last_tick_wall_time: now,
            accumulated_debt: Duration::ZERO,
            last_stall_clamp: None,
            warned_backwards: false,
            warp: None,
            profiler_position: String::new(),
        })
    }

    /// Resumes the tick counter at `tick`, for a simulation restored from a save.
    ///
    /// The next tick executed is `tick + 1` and maintenance intervals count
    /// from `tick`. Only meaningful before the first cycle.
    #[must_use]
    pub fn starting_at(mut self, tick: u64) -> Self {
        self.shared.set_tick_count(tick);
        self.maintenance.rebase(tick);
        self
    }

    /// Registers an extra recurring job, run after the built-in ones.
    pub fn register_maintenance<F>(
        &mut self,
        name: &'static str,
        interval_ticks: u64,
        policy: FailurePolicy,
        action: F,
    ) where
        F: FnMut(&mut S, &MaintenanceContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.maintenance
            .register(name, interval_ticks, policy, action);
    }

    /// A handle other threads use to control the loop.
    #[must_use]
    pub fn handle(&self) -> DriverHandle {
        DriverHandle {
            shared: Arc::clone(&self.shared),
            tasks: Arc::clone(&self.tasks),
        }
    }

    /// The simulation being ticked.
    #[must_use]
    pub fn simulation(&self) -> &S {
        &self.sim
    }

    /// Mutable access to the simulation between cycles.
    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    /// Ticks completed so far.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.shared.tick_count()
    }

    /// Wall time owed to the schedule that has not been ticked yet.
    #[must_use]
    pub fn accumulated_debt(&self) -> Duration {
        self.accumulated_debt
    }

    /// Recent tick timings.
    #[must_use]
    pub fn timings(&self) -> &TickTimings {
        &self.timings
    }

    /// Recoverable faults seen recently, oldest first.
    pub fn recent_faults(&self) -> impl Iterator<Item = &FaultRecord> {
        self.faults.recent()
    }

    /// Runs the loop on the current thread until it is stopped or a fatal fault occurs.
    ///
    /// Shutdown always runs before returning: queued tasks are executed,
    /// sessions released and every unit saved, each step best-effort.
    ///
    /// # Errors
    /// Returns the fatal fault that ended the loop. Its crash report has
    /// already been written.
    pub fn run(&mut self) -> Result<(), FatalFault> {
        if self.shared.state() == DriverState::Stopped {
            return Ok(());
        }
        self.tasks.bind_current_thread();

        let now = self.clock.now();
        self.last_tick_wall_time = now;
        self.accumulated_debt = Duration::ZERO;
        self.shared.heartbeat.refresh(now);
        log::info!(
            "Tick loop started at {} TPS",
            self.shared.tick_rate()
        );

        let result = loop {
            if !self.shared.state().is_ticking() {
                break Ok(());
            }
            if let Err(fault) = self.cycle() {
                break Err(fault);
            }
        };

        self.shutdown();
        result
    }

    /// Runs one iteration of the loop: measure, tick what is owed, sleep.
    ///
    /// The calling thread becomes the simulation thread. Does nothing once
    /// a stop was requested.
    ///
    /// # Errors
    /// Returns a fatal fault raised by a tick. The driver is then stopping
    /// and will not tick again.
    pub fn cycle(&mut self) -> Result<CycleReport, FatalFault> {
        if !self.tasks.is_simulation_thread() {
            self.tasks.bind_current_thread();
        }
        match self.shared.state() {
            DriverState::Running => self.paced_cycle(),
            DriverState::Warping => self.warp_cycle(),
            DriverState::Stopping | DriverState::Stopped => Ok(CycleReport::default()),
        }
    }

    fn paced_cycle(&mut self) -> Result<CycleReport, FatalFault> {
        let period = tick_period(self.shared.tick_rate());
        let now = self.clock.now();
        let (elapsed, stall_clamped) = self.measure_elapsed(now, period);
        self.last_tick_wall_time = now;
        self.accumulated_debt += elapsed;

        let mut report = CycleReport {
            stall_clamped,
            ..CycleReport::default()
        };

        if self.sim.fast_forward_eligible() {
            self.tick()?;
            report.ticks_run = 1;
            self.accumulated_debt = Duration::ZERO;
        } else {
            while self.accumulated_debt >= period && self.shared.state() == DriverState::Running {
                if self.config.watchdog_fix && report.ticks_run > 0 {
                    self.shared.heartbeat.refresh(self.clock.now());
                    report.falling_behind = true;
                }
                self.accumulated_debt -= period;
                self.tick()?;
                report.ticks_run += 1;
                if self.config.disable_catch_up {
                    // Only the time the tick itself took is owed.
                    self.accumulated_debt = self.clock.now().saturating_sub(now);
                    break;
                }
            }
        }

        if self.shared.state() == DriverState::Running {
            let min_yield = self.config.min_yield();
            report.slept = if report.falling_behind {
                min_yield
            } else {
                min_yield.max(period.saturating_sub(self.accumulated_debt))
            };
            self.clock.sleep(report.slept);
        }
        self.shared.heartbeat.refresh(self.clock.now());
        Ok(report)
    }

    /// Time since the previous cycle, after the backwards and stall rules.
    fn measure_elapsed(&mut self, now: Duration, period: Duration) -> (Duration, bool) {
        let Some(elapsed) = now.checked_sub(self.last_tick_wall_time) else {
            if !self.warned_backwards {
                log::warn!("Time ran backwards! Did the system time change?");
                self.warned_backwards = true;
            }
            return (Duration::ZERO, false);
        };
        self.warned_backwards = false;

        let clamp = self.config.stall_clamp();
        if elapsed > clamp {
            let cooldown = self.config.stall_warning_cooldown();
            let cooled_down = self
                .last_stall_clamp
                .is_none_or(|at| now.saturating_sub(at) >= cooldown);
            if cooled_down {
                let skipped = (elapsed - clamp).as_nanos() / period.as_nanos().max(1);
                log::warn!(
                    "Can't keep up! Is the server overloaded? Running {}ms behind, skipping {skipped} tick(s)",
                    elapsed.as_millis()
                );
                self.last_stall_clamp = Some(now);
                return (clamp, true);
            }
        }
        (elapsed, false)
    }

    fn warp_cycle(&mut self) -> Result<CycleReport, FatalFault> {
        if self.warp.is_none() {
            let requested = self.shared.warp_remaining();
            log::info!("Warping {requested} tick(s)");
            self.warp = Some(WarpProgress {
                requested,
                start_tick: self.tick_count(),
                started: self.clock.now(),
            });
        }

        let mut report = CycleReport::default();
        match self.shared.consume_warp_tick() {
            Some(left) => {
                self.tick()?;
                report.ticks_run = 1;
                self.shared.heartbeat.refresh(self.clock.now());
                if left == 1 {
                    report.warp_finished = self.finish_warp();
                }
            }
            None => report.warp_finished = self.finish_warp(),
        }
        Ok(report)
    }

    fn finish_warp(&mut self) -> Option<WarpSummary> {
        let summary = self.warp.take().map(|progress| {
            let summary = WarpSummary {
                requested: progress.requested,
                ticks: self.tick_count() - progress.start_tick,
                elapsed: self.clock.now().saturating_sub(progress.started),
            };
            let mspt = if summary.ticks == 0 {
                0.0
            } else {
                summary.elapsed.as_secs_f64() * 1000.0 / summary.ticks as f64
            };
            log::info!(
                "Warp finished: {} of {} tick(s) in {:.2}s ({mspt:.2} mspt)",
                summary.ticks,
                summary.requested,
                summary.elapsed.as_secs_f64()
            );
            summary
        });
        // Warped time is not owed to the normal schedule.
        self.last_tick_wall_time = self.clock.now();
        self.accumulated_debt = Duration::ZERO;
        self.shared
            .transition(DriverState::Warping, DriverState::Running);
        summary
    }

    fn tick(&mut self) -> Result<(), FatalFault> {
        let started = Instant::now();
        let tick = self.shared.tick_count() + 1;

        self.set_profiler_position("tasks", None);
        self.tasks.drain();

        if let Some(failure) = self.run_phases(tick) {
            return Err(self.fatal(failure));
        }
        if let Some(failure) = self.run_maintenance(tick) {
            return Err(self.fatal(failure));
        }

        self.shared.set_tick_count(tick);
        self.timings.record(started.elapsed());
        Ok(())
    }

    fn run_phases(&mut self, tick: u64) -> Option<Failure> {
        let Self {
            sim,
            phases,
            faults,
            profiler_position,
            ..
        } = self;

        for phase in phases.iter_mut() {
            let name = phase.name();
            match phase.scope() {
                PhaseScope::Server => {
                    write_position(profiler_position, name, None);
                    let scope = FaultScope {
                        phase: name,
                        unit: None,
                        tick,
                    };
                    let ctx = PhaseContext { tick, unit: None };
                    if let Some(failure) = run_isolated(faults, sim, &mut phase.invoke, scope, ctx) {
                        return Some(failure);
                    }
                }
                PhaseScope::PerUnit => {
                    for unit in 0..sim.unit_count() {
                        let unit_name = sim.unit_name(unit);
                        write_position(profiler_position, name, Some(&unit_name));
                        let scope = FaultScope {
                            phase: name,
                            unit: Some(unit_name.as_str()),
                            tick,
                        };
                        let ctx = PhaseContext {
                            tick,
                            unit: Some(unit),
                        };
                        if let Some(failure) =
                            run_isolated(faults, sim, &mut phase.invoke, scope, ctx)
                        {
                            return Some(failure);
                        }
                    }
                }
            }
        }
        None
    }

    fn run_maintenance(&mut self, tick: u64) -> Option<Failure> {
        self.set_profiler_position("maintenance", None);
        let ctx = MaintenanceContext {
            tick,
            tick_rate: self.shared.tick_rate(),
            state: self.shared.state(),
            timings: &self.timings,
            status: &self.shared.status,
        };
        match self
            .maintenance
            .run_due(&mut self.sim, &ctx, &mut self.faults)
        {
            Ok(recovered) => {
                for record in recovered {
                    self.sim.notify_operators(&record.notice());
                }
                None
            }
            Err(failure) => Some(failure),
        }
    }

    fn set_profiler_position(&mut self, phase: &str, unit: Option<&str>) {
        write_position(&mut self.profiler_position, phase, unit);
    }

    /// Builds and saves the crash report, and moves the driver to stopping.
    fn fatal(&mut self, failure: Failure) -> FatalFault {
        self.shared.begin_stop();
        let Failure { record, error } = failure;
        log::error!("Fatal fault in {record}");

        let tick_rate = self.shared.tick_rate();
        let report = CrashReport {
            title: CrashReport::title_for(&record.phase, record.unit.is_some()),
            time: CrashReport::now(),
            fault: record.clone(),
            profiler_position: self.profiler_position.clone(),
            session_count: panic::catch_unwind(AssertUnwindSafe(|| self.sim.session_count()))
                .unwrap_or_default(),
            ticks_completed: self.tick_count(),
            tick_rate,
            timings: self.timings.summary(tick_rate),
            recent_faults: self.faults.recent().cloned().collect(),
            units: self.describe_units(),
        };

        let report_path = match self.reporter.write(&report) {
            Ok(path) => {
                log::error!("This crash report has been saved to: {}", path.display());
                Some(path)
            }
            Err(err) => {
                log::error!("We were unable to save this crash report to disk: {err}");
                None
            }
        };

        FatalFault {
            record,
            error,
            report: Box::new(report),
            report_path,
        }
    }

    fn describe_units(&self) -> serde_json::Value {
        panic::catch_unwind(AssertUnwindSafe(|| {
            self.sim.describe_state_for_diagnostics()
        }))
        .unwrap_or_else(|payload| {
            serde_json::json!({
                "error": format!("diagnostics failed: {}", panic_message(payload.as_ref()))
            })
        })
    }

    fn shutdown(&mut self) {
        self.shared.begin_stop();
        log::info!("Stopping server");

        self.tasks.drain();
        self.best_effort("releasing sessions", S::release);
        log::info!("Saving units");
        self.best_effort("saving", |sim| sim.save_all(true));
        self.tasks.mark_stopped();

        self.shared.mark_stopped();
        let tick_rate = self.shared.tick_rate();
        let summary = self.timings.summary(tick_rate);
        self.shared.status.store(Arc::new(StatusSnapshot {
            tick: self.tick_count(),
            state: DriverState::Stopped,
            tick_rate,
            mspt: summary.mspt,
            tps: summary.tps,
            session_count: 0,
        }));
        log::info!("Server stopped after {} tick(s)", self.tick_count());
    }

    fn best_effort<F>(&mut self, step: &str, action: F)
    where
        F: FnOnce(&mut S) -> anyhow::Result<()>,
    {
        let sim = &mut self.sim;
        match panic::catch_unwind(AssertUnwindSafe(|| action(sim))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::error!("Exception stopping the server while {step}: {err:#}"),
            Err(payload) => log::error!(
                "Exception stopping the server while {step}: {}",
                panic_message(payload.as_ref())
            ),
        }
    }
}

fn run_isolated<S: Simulation>(
    faults: &mut FaultIsolation,
    sim: &mut S,
    invoke: &mut PhaseFn<S>,
    scope: FaultScope<'_>,
    ctx: PhaseContext,
) -> Option<Failure> {
    match faults.run(scope, || invoke(sim, &ctx)) {
        PhaseOutcome::Completed => None,
        PhaseOutcome::Recovered(record) => {
            sim.notify_operators(&record.notice());
            None
        }
        PhaseOutcome::Fatal(failure) => Some(failure),
    }
}

fn write_position(position: &mut String, phase: &str, unit: Option<&str>) {
    position.clear();
    position.push_str(phase);
    if let Some(unit) = unit {
        let _ = write!(position, "/{unit}");
    }
}

fn register_builtin_jobs<S: Simulation + 'static>(
    maintenance: &mut MaintenanceScheduler<S>,
    config: &TickConfig,
) {
    maintenance.register(
        "autosave",
        config.autosave_interval,
        FailurePolicy::Log,
        |sim, ctx| {
            log::debug!("Autosaving at tick {}", ctx.tick);
            sim.save_all(false)
        },
    );
    maintenance.register(
        "status",
        config.status_interval,
        FailurePolicy::Fatal,
        |sim, ctx| {
            ctx.publish_status(sim.session_count());
            Ok(())
        },
    );
    maintenance.register(
        "statistics",
        config.stats_interval,
        FailurePolicy::Fatal,
        |_, ctx| {
            let summary = ctx.timings.summary(ctx.tick_rate);
            log::info!(
                "Tick {}: {:.2} mspt, {:.1} TPS (p95 {:.2} ms, p99 {:.2} ms)",
                ctx.tick,
                summary.mspt,
                summary.tps,
                summary.p95,
                summary.p99
            );
            Ok(())
        },
    );
}
