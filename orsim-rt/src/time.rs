//! Functionality for simulating the passage of time.
//!
//! We do this by providing [`EventLoop`], a discrete-event scheduler
//! with its own view of the current time.  Time only advances when an
//! event fires; between events nothing happens and no real time is
//! consumed.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::rc::Rc;
use std::time::Duration;

/// A handle to a scheduled event.
///
/// Handles stay valid forever; a handle whose event has already fired
/// or been cancelled is simply no longer *pending*.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct EventId(u64);

/// An entry in the event queue: a callback and the time to run it.
struct Event {
    /// The virtual time at which this event should fire.
    when: Duration,
    /// Identifier of this event; also the tie-breaker that keeps
    /// same-time events in scheduling order.
    id: u64,
    /// The callback to invoke.
    callback: Box<dyn FnOnce()>,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.id == other.id
    }
}
impl Eq for Event {}
impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest first; among equals, lowest id first.  Reversed
        // because BinaryHeap is a max-heap.
        self.when
            .cmp(&other.when)
            .then(self.id.cmp(&other.id))
            .reverse()
    }
}

/// Shared state of an event loop.
struct Schedule {
    /// The current virtual time.  This value only moves forward.
    now: Duration,
    /// Identifier for the next event scheduled.
    next_id: u64,
    /// Priority queue of events, earliest first.
    queue: BinaryHeap<Event>,
    /// Identifiers of events that are scheduled but have neither fired
    /// nor been cancelled.
    pending: HashSet<u64>,
}

/// A single-threaded discrete-event scheduler with a virtual clock.
///
/// Cloning an `EventLoop` produces another handle to the same queue;
/// handles are cheap and freely shareable within the thread.
///
/// Events are one-shot closures keyed to a virtual instant.  They fire
/// in time order, ties broken by scheduling order, and each one runs
/// to completion before the next starts.  An event may schedule
/// further events, but the loop never invokes one callback from inside
/// another.
#[derive(Clone)]
pub struct EventLoop {
    /// The shared backend for this loop and all its handles.
    state: Rc<RefCell<Schedule>>,
}

impl EventLoop {
    /// Create a new, empty event loop with its clock at zero.
    pub fn new() -> Self {
        EventLoop {
            state: Rc::new(RefCell::new(Schedule {
                now: Duration::from_secs(0),
                next_id: 0,
                queue: BinaryHeap::new(),
                pending: HashSet::new(),
            })),
        }
    }

    /// Return the current virtual time.
    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    /// Schedule `callback` to fire `delay` after the current virtual
    /// time, and return a handle to the new event.
    pub fn schedule_in(&self, delay: Duration, callback: impl FnOnce() + 'static) -> EventId {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        let when = state.now + delay;
        state.pending.insert(id);
        state.queue.push(Event {
            when,
            id,
            callback: Box::new(callback),
        });
        EventId(id)
    }

    /// Cancel a scheduled event.  Cancelling an event that has already
    /// fired (or was already cancelled) does nothing.
    pub fn cancel(&self, event: EventId) {
        self.state.borrow_mut().pending.remove(&event.0);
    }

    /// Return true if `event` is scheduled and has not yet fired or
    /// been cancelled.
    pub fn is_pending(&self, event: EventId) -> bool {
        self.state.borrow().pending.contains(&event.0)
    }

    /// Return the number of pending events.
    pub fn pending_events(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Fire the next event, if there is one due at or before
    /// `deadline` (or at any time, when `deadline` is None).
    ///
    /// Returns false when there was nothing to do.
    fn fire_next(&self, deadline: Option<Duration>) -> bool {
        let callback = {
            let mut state = self.state.borrow_mut();
            let due = match state.queue.peek() {
                Some(ev) => match deadline {
                    Some(d) => ev.when <= d,
                    None => true,
                },
                None => false,
            };
            if !due {
                return false;
            }
            match state.queue.pop() {
                Some(ev) => {
                    if state.pending.remove(&ev.id) {
                        state.now = ev.when;
                        Some(ev.callback)
                    } else {
                        // Cancelled; drop the callback without running it.
                        None
                    }
                }
                None => return false,
            }
        };
        // The borrow is released here: the callback is free to
        // schedule or cancel events.
        if let Some(cb) = callback {
            cb();
        }
        true
    }

    /// Run events until the queue is empty.
    ///
    /// Beware: a workload with a self-rescheduling event (such as a
    /// periodic refill timer) never drains, and this function will not
    /// return for it.  Use [`run_until`](EventLoop::run_until) there.
    pub fn run(&self) {
        while self.fire_next(None) {}
    }

    /// Run every event due at or before `deadline`, then advance the
    /// clock to `deadline`.
    pub fn run_until(&self, deadline: Duration) {
        while self.fire_next(Some(deadline)) {}
        let mut state = self.state.borrow_mut();
        if state.now < deadline {
            state.now = deadline;
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
