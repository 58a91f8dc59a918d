//! Deferred event scheduling.
//!
//! Simulation logic uses this to schedule location-keyed mutations for a
//! future tick, for example a block that must update again in four ticks.
//!
//! # Architecture
//!
//! - [`ScheduledEvent`] - A single pending event
//! - [`TickPriority`] - Priority for ordering events within the same tick
//! - [`EventHandle`] - Identifies a pending event for cancellation
//! - [`DeferredEventQueue`] - The ordered, deduplicated set of pending events
//!
//! The queue is owned by simulation-thread state. Other threads that want to
//! schedule something submit a task through [`crate::tasks::TaskQueue`].

mod deferred_queue;
mod scheduled_event;

pub use deferred_queue::DeferredEventQueue;
pub use scheduled_event::{EventHandle, ScheduledEvent, TickPriority};
