//! Location-keyed deferred event queue.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::mem;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::scheduled_event::EventOrder;
use super::{EventHandle, ScheduledEvent, TickPriority};

/// Pending payloads at one location, with their position in the queue.
type LocationEntries<P> = SmallVec<[(P, EventOrder); 2]>;

/// Ordered set of future location-keyed events.
///
/// # Architecture
///
/// - `queue` is an ordered index keyed by (trigger tick, priority, sequence),
///   so due events come out of the front in their final order
/// - `by_location` maps each location to its pending payloads, used for
///   deduplication and for cancelling everything at a location
/// - `next_sequence` hands out insertion order; it is never reused
///
/// Each (location, payload) pair is pending at most once. Scheduling a pair
/// that is already pending is ignored and the existing timing is kept.
pub struct DeferredEventQueue<K, P> {
    queue: BTreeMap<EventOrder, ScheduledEvent<K, P>>,
    by_location: FxHashMap<K, LocationEntries<P>>,
    next_sequence: u64,
}

impl<K, P> DeferredEventQueue<K, P>
where
    K: Copy + Eq + Hash + Debug,
    P: Copy + Eq,
{
    /// Creates a new empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            by_location: FxHashMap::default(),
            next_sequence: 0,
        }
    }

    /// Schedules `payload` at `location` to fire on `trigger_tick`.
    ///
    /// Returns `None` if the same payload is already pending at that location.
    /// A `trigger_tick` at or before the tick currently being processed makes
    /// the event due on the next drain.
    pub fn schedule(
        &mut self,
        location: K,
        payload: P,
        trigger_tick: u64,
        priority: TickPriority,
    ) -> Option<EventHandle> {
        if self.has_scheduled(location, payload) {
            log::trace!("Ignoring duplicate event at {location:?} for tick {trigger_tick}");
            return None;
        }
        Some(self.insert(location, payload, trigger_tick, priority))
    }

    /// Schedules an event `delay` ticks after `current_tick`.
    pub fn schedule_in(
        &mut self,
        location: K,
        payload: P,
        current_tick: u64,
        delay: u32,
        priority: TickPriority,
    ) -> Option<EventHandle> {
        self.schedule(
            location,
            payload,
            current_tick.saturating_add(u64::from(delay)),
            priority,
        )
    }

    /// Replaces any pending (location, payload) event with a new one.
    ///
    /// The replacement gets a fresh sequence number, so it orders after every
    /// event already scheduled for the same tick and priority.
    pub fn reschedule(
        &mut self,
        location: K,
        payload: P,
        trigger_tick: u64,
        priority: TickPriority,
    ) -> EventHandle {
        if let Some(entries) = self.by_location.get_mut(&location)
            && let Some(index) = entries.iter().position(|(p, _)| *p == payload)
        {
            let (_, order) = entries.swap_remove(index);
            if entries.is_empty() {
                self.by_location.remove(&location);
            }
            self.queue.remove(&order);
        }
        self.insert(location, payload, trigger_tick, priority)
    }

    fn insert(
        &mut self,
        location: K,
        payload: P,
        trigger_tick: u64,
        priority: TickPriority,
    ) -> EventHandle {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let event = ScheduledEvent {
            location,
            payload,
            trigger_tick,
            priority,
            sequence,
        };
        let order = event.order();
        self.queue.insert(order, event);
        self.by_location
            .entry(location)
            .or_default()
            .push((payload, order));

        EventHandle(order)
    }

    /// Cancels a single pending event. Returns `false` if it is no longer pending.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        let Some(event) = self.queue.remove(&handle.0) else {
            return false;
        };
        self.forget(&event);
        true
    }

    /// Cancels every pending event at `location`, returning how many were removed.
    pub fn cancel_all_at(&mut self, location: K) -> usize {
        let Some(entries) = self.by_location.remove(&location) else {
            return 0;
        };
        for (_, order) in &entries {
            self.queue.remove(order);
        }
        entries.len()
    }

    /// Removes and returns every event due at or before `current_tick`, in order.
    ///
    /// The returned batch is detached from the queue: anything scheduled while
    /// the caller works through it, even for `current_tick` itself, waits for
    /// the next drain.
    pub fn drain_due(&mut self, current_tick: u64) -> Vec<ScheduledEvent<K, P>> {
        let due = match current_tick.checked_add(1) {
            Some(next) => {
                let later = self.queue.split_off(&EventOrder::first_at(next));
                mem::replace(&mut self.queue, later)
            }
            None => mem::take(&mut self.queue),
        };

        let due: Vec<_> = due.into_values().collect();
        for event in &due {
            self.forget(event);
        }
        due
    }

    /// Like [`drain_due`](Self::drain_due) but returns at most `max_events`.
    ///
    /// Due events past the limit stay queued in order and come out first next time.
    pub fn drain_due_limited(
        &mut self,
        current_tick: u64,
        max_events: usize,
    ) -> Vec<ScheduledEvent<K, P>> {
        let mut due = Vec::new();
        while due.len() < max_events {
            let Some(entry) = self.queue.first_entry() else {
                break;
            };
            if entry.key().trigger_tick > current_tick {
                break;
            }
            let event = entry.remove();
            self.forget(&event);
            due.push(event);
        }
        due
    }

    fn forget(&mut self, event: &ScheduledEvent<K, P>) {
        let order = event.order();
        if let Some(entries) = self.by_location.get_mut(&event.location) {
            entries.retain(|(_, o)| *o != order);
            if entries.is_empty() {
                self.by_location.remove(&event.location);
            }
        }
    }

    /// Checks if `payload` is already pending at `location`.
    #[must_use]
    pub fn has_scheduled(&self, location: K, payload: P) -> bool {
        self.by_location
            .get(&location)
            .is_some_and(|entries| entries.iter().any(|(p, _)| *p == payload))
    }

    /// Returns the trigger tick of the earliest pending event.
    #[must_use]
    pub fn peek_next_tick(&self) -> Option<u64> {
        self.queue.first_key_value().map(|(order, _)| order.trigger_tick)
    }

    /// Returns an iterator over pending events in firing order.
    pub fn iter(&self) -> impl Iterator<Item = &ScheduledEvent<K, P>> {
        self.queue.values()
    }

    /// Returns the number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops every pending event. Sequence numbers keep counting.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.by_location.clear();
    }
}

impl<K, P> Default for DeferredEventQueue<K, P>
where
    K: Copy + Eq + Hash + Debug,
    P: Copy + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}
