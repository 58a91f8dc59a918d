//! # Pulse Core
//!
//! The heartbeat of a tick-based simulation server: a fixed-rate tick loop
//! with catch-up, warp and stall handling, the queues that feed work into it
//! and the fault isolation that keeps one broken world from taking the server
//! down with it.
//!
//! Start with [`driver::TickDriver`]. Everything else is a building block it
//! uses, exposed for simulations that need them directly.
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    missing_docs,
    clippy::unwrap_used
)]
#![allow(
    clippy::single_call_fn,
    clippy::multiple_inherent_impl,
    clippy::shadow_unrelated,
    clippy::missing_errors_doc,
    clippy::struct_excessive_bools,
    clippy::needless_pass_by_value,
    clippy::cargo_common_metadata,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]

pub mod clock;
pub mod config;
pub mod crash;
pub mod driver;
pub mod fault;
pub mod maintenance;
pub mod tasks;
pub mod ticks;
pub mod timings;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TickConfig;
pub use driver::{
    CycleReport, DriverError, DriverHandle, DriverState, FatalFault, Phase, PhaseContext,
    PhaseScope, Simulation, TickDriver, WarpSummary,
};
pub use fault::SuppressedFault;
pub use tasks::{TaskError, TaskHandle, TaskQueue};
