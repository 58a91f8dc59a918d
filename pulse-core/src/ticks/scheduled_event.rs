//! Scheduled event types.

use std::cmp::Ordering;

/// Priority level for scheduled events.
///
/// When multiple events fire on the same tick, they are processed
/// in priority order (lower value first), then by insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i8)]
pub enum TickPriority {
    /// Extremely high priority (-3)
    ExtremelyHigh = -3,
    /// Very high priority (-2)
    VeryHigh = -2,
    /// High priority (-1)
    High = -1,
    /// Normal priority (0) - default
    #[default]
    Normal = 0,
    /// Low priority (1)
    Low = 1,
    /// Very low priority (2)
    VeryLow = 2,
    /// Extremely low priority (3)
    ExtremelyLow = 3,
}

impl TickPriority {
    /// Returns the numeric value of this priority.
    /// Lower values = higher priority.
    #[inline]
    #[must_use]
    pub const fn value(self) -> i8 {
        self as i8
    }
}

impl PartialOrd for TickPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TickPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value().cmp(&other.value())
    }
}

/// Position of an event in the queue's total order.
///
/// Orders by trigger tick, then priority, then sequence number. Two events
/// never share a sequence number, so no two orders compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct EventOrder {
    pub(crate) trigger_tick: u64,
    pub(crate) priority: TickPriority,
    pub(crate) sequence: u64,
}

impl EventOrder {
    /// The smallest possible order for events triggering at `tick`.
    pub(crate) const fn first_at(tick: u64) -> Self {
        Self {
            trigger_tick: tick,
            priority: TickPriority::ExtremelyHigh,
            sequence: 0,
        }
    }
}

/// Opaque handle to a pending event, returned by the scheduling calls.
///
/// Only useful for [`cancel`](super::DeferredEventQueue::cancel); a handle whose
/// event already fired or was cancelled is simply stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub(crate) EventOrder);

impl EventHandle {
    /// The tick this event was scheduled to fire on.
    #[must_use]
    pub const fn trigger_tick(&self) -> u64 {
        self.0.trigger_tick
    }
}

/// A deferred mutation at a location.
///
/// Events are used by block logic, fluids and anything else that needs
/// to run at a specific future tick.
#[derive(Debug, Clone)]
pub struct ScheduledEvent<K, P> {
    /// Where the event applies.
    pub location: K,
    /// What should happen there.
    pub payload: P,
    /// The absolute tick when this should fire.
    pub trigger_tick: u64,
    /// Priority for ordering within the same tick.
    pub priority: TickPriority,
    /// Insertion order for events with same `trigger_tick` and priority.
    /// Lower values run first.
    pub sequence: u64,
}

impl<K, P> ScheduledEvent<K, P> {
    pub(crate) const fn order(&self) -> EventOrder {
        EventOrder {
            trigger_tick: self.trigger_tick,
            priority: self.priority,
            sequence: self.sequence,
        }
    }

    /// Returns the handle identifying this event.
    #[must_use]
    pub const fn handle(&self) -> EventHandle {
        EventHandle(self.order())
    }
}

impl<K: PartialEq, P: PartialEq> PartialEq for ScheduledEvent<K, P> {
    /// Events are the same event if they target the same location with the same payload.
    fn eq(&self, other: &Self) -> bool {
        self.location == other.location && self.payload == other.payload
    }
}

impl<K: Eq, P: Eq> Eq for ScheduledEvent<K, P> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(trigger_tick: u64, priority: TickPriority, sequence: u64) -> EventOrder {
        EventOrder {
            trigger_tick,
            priority,
            sequence,
        }
    }

    #[test]
    fn test_event_ordering() {
        // Earlier trigger_tick should come first
        assert!(order(100, TickPriority::Normal, 5) < order(200, TickPriority::Normal, 0));

        // Same trigger_tick, higher priority should come first
        assert!(order(100, TickPriority::High, 9) < order(100, TickPriority::Normal, 0));
        assert!(order(100, TickPriority::Normal, 9) < order(100, TickPriority::Low, 0));

        // Same trigger_tick and priority, lower sequence should come first
        assert!(order(100, TickPriority::Normal, 5) < order(100, TickPriority::Normal, 10));
    }

    #[test]
    fn test_first_at_precedes_every_event_on_that_tick() {
        let first = EventOrder::first_at(7);
        assert!(first <= order(7, TickPriority::ExtremelyHigh, 0));
        assert!(first < order(7, TickPriority::Normal, 0));
        assert!(first > order(6, TickPriority::ExtremelyLow, u64::MAX));
    }

    #[test]
    fn test_equality_ignores_timing() {
        let a = ScheduledEvent {
            location: (1, 2),
            payload: 'x',
            trigger_tick: 10,
            priority: TickPriority::Normal,
            sequence: 0,
        };
        let b = ScheduledEvent {
            trigger_tick: 99,
            priority: TickPriority::Low,
            sequence: 42,
            ..a.clone()
        };
        assert_eq!(a, b);
        assert_ne!(a.handle(), b.handle());
    }
}
