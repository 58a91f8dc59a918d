//! What the driver ticks.

/// The simulation the driver advances.
///
/// The driver owns the simulation and only touches it from the simulation
/// thread. A simulation is split into units (worlds); per-unit phases run once
/// for every unit, each under its own fault boundary.
pub trait Simulation {
    /// Number of independently ticked units.
    fn unit_count(&self) -> usize;

    /// Display name of unit `index`, used in logs and fault records.
    fn unit_name(&self, index: usize) -> String;

    /// `true` when nothing observable would notice ticks running early,
    /// e.g. every connected player is asleep. The driver then ticks once per
    /// cycle without waiting for debt to build up.
    fn fast_forward_eligible(&self) -> bool {
        false
    }

    /// Number of connected sessions.
    fn session_count(&self) -> usize {
        0
    }

    /// Per-unit state included in crash reports.
    fn describe_state_for_diagnostics(&self) -> serde_json::Value;

    /// Tells operators about a recovered fault.
    fn notify_operators(&mut self, notice: &str);

    /// Persists every unit. `flush` asks for the data to reach disk before returning.
    fn save_all(&mut self, flush: bool) -> anyhow::Result<()>;

    /// Disconnects sessions and releases outside resources during shutdown.
    fn release(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// How often a phase runs within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseScope {
    /// Once per unit, each call isolated from the others.
    PerUnit,
    /// Once for the whole server.
    Server,
}

/// Passed to every phase invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseContext {
    /// The tick being executed, starting at 1.
    pub tick: u64,
    /// The unit being ticked, for per-unit phases.
    pub unit: Option<usize>,
}

pub(crate) type PhaseFn<S> = Box<dyn FnMut(&mut S, &PhaseContext) -> anyhow::Result<()> + Send>;

/// A named step of every tick.
pub struct Phase<S> {
    name: &'static str,
    scope: PhaseScope,
    pub(crate) invoke: PhaseFn<S>,
}

impl<S> Phase<S> {
    /// A phase run once for every unit.
    pub fn per_unit<F>(name: &'static str, invoke: F) -> Self
    where
        F: FnMut(&mut S, &PhaseContext) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name,
            scope: PhaseScope::PerUnit,
            invoke: Box::new(invoke),
        }
    }

    /// A phase run once per tick.
    pub fn server<F>(name: &'static str, invoke: F) -> Self
    where
        F: FnMut(&mut S, &PhaseContext) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name,
            scope: PhaseScope::Server,
            invoke: Box::new(invoke),
        }
    }

    /// The phase's name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// How often the phase runs.
    #[must_use]
    pub fn scope(&self) -> PhaseScope {
        self.scope
    }
}
