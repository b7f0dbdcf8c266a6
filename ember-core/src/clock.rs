//! Discrete-event clock driving a simulated core.
//!
//! The simulation never blocks a host thread. Components instead reify their
//! "next step" as a [`ClockEvent`] enqueued a chosen number of simulated
//! cycles in the future. All state transitions happen inside event handlers,
//! which run to completion without yielding.
//!
//! The handler bound to an event is plain data (typically a function
//! pointer), and can be rebound between invocations. This is how the core
//! switches between its fast and slow dispatch paths without any dynamic
//! dispatch.

use log::trace;

/// Simulated cycle count. Cycle counts are monotonic and never wrap in
/// practice.
pub type Cycles = u64;

/// Handle to an event registered on a [`Clock`].
///
/// Handles stay valid for the lifetime of the clock; events are never
/// deregistered, only cancelled and re-enqueued.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ClockEvent(usize);

#[derive(Debug)]
struct EventSlot<T> {
    handler: T,
    /// Absolute cycle at which the event fires, or `None` if not enqueued.
    due: Option<Cycles>,
}

/// An event queue counting in simulated clock cycles.
///
/// `T` is the handler payload stored in each event record. It is returned by
/// value from [`Clock::pop_due`], so the caller can invoke it while holding a
/// mutable borrow of whatever state the handler needs (including the clock
/// itself).
#[derive(Debug)]
pub struct Clock<T> {
    cycles: Cycles,
    events: Vec<EventSlot<T>>,
}

impl<T: Copy> Clock<T> {
    pub fn new() -> Self {
        Self {
            cycles: 0,
            events: Vec::new(),
        }
    }

    /// Returns the current simulated time in cycles.
    pub fn cycles(&self) -> Cycles {
        self.cycles
    }

    /// Registers a new event bound to `handler`. The event starts out not
    /// enqueued.
    pub fn new_event(&mut self, handler: T) -> ClockEvent {
        self.events.push(EventSlot { handler, due: None });
        ClockEvent(self.events.len() - 1)
    }

    /// Rebinds `event` to a new handler. Takes effect from the next firing,
    /// whether or not the event is currently enqueued.
    pub fn rebind(&mut self, event: ClockEvent, handler: T) {
        self.events[event.0].handler = handler;
    }

    /// Schedules `event` to fire `delay` cycles from now. An event can be
    /// enqueued at most once; re-enqueueing moves its firing time.
    pub fn enqueue(&mut self, event: ClockEvent, delay: Cycles) {
        trace!("enqueueing event {} at +{delay}", event.0);
        self.events[event.0].due = Some(self.cycles + delay);
    }

    /// Removes `event` from the queue if it is enqueued.
    pub fn cancel(&mut self, event: ClockEvent) {
        if self.events[event.0].due.take().is_some() {
            trace!("cancelled event {}", event.0);
        }
    }

    pub fn is_enqueued(&self, event: ClockEvent) -> bool {
        self.events[event.0].due.is_some()
    }

    /// Returns the firing time of the next enqueued event, if any.
    pub fn next_due(&self) -> Option<Cycles> {
        self.events.iter().filter_map(|slot| slot.due).min()
    }

    /// Dequeues the event with the earliest firing time, advances the clock
    /// to that time, and returns the bound handler.
    ///
    /// Returns `None` if nothing is enqueued, leaving the clock untouched;
    /// the simulation is then suspended until an external input enqueues an
    /// event again.
    pub fn pop_due(&mut self) -> Option<T> {
        let (index, due) = self
            .events
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.due.map(|due| (i, due)))
            .min_by_key(|&(_, due)| due)?;
        self.cycles = due;
        let slot = &mut self.events[index];
        slot.due = None;
        Some(slot.handler)
    }
}

impl<T: Copy> Default for Clock<T> {
    fn default() -> Self {
        Self::new()
    }
}
