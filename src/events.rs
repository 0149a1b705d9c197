//! Zero-delay event scheduling.
//!
//! The copy engine is not allowed to re-enter itself; when it must make
//! progress from inside its own call stack (a synchronous completion, or a
//! new copy issued from within a delivery callback), it detours through the
//! event scheduler and resumes at the top level of the loop.

use std::cell::RefCell;
use std::collections::VecDeque;

use tracing::trace;

/// The event scheduler collaborator.
///
/// Implementations must run scheduled callbacks on the same thread, at the
/// top level of the event loop (never from inside another callback's
/// stack), in submission order.
pub trait Events {
    /// Queues `f` to run at the loop's earliest convenience.
    ///
    /// `name` labels the event in logs.
    fn schedule(&self, name: &'static str, f: Box<dyn FnOnce()>);
}

/// A scheduled callback waiting to run.
struct Event {
    /// Label for logs.
    name: &'static str,
    /// The callback.
    f: Box<dyn FnOnce()>,
}

/// A deterministic FIFO event queue.
///
/// This is the scheduler the crate ships; embedders with their own loop can
/// implement [`Events`] directly. Nothing runs until [`run_pending`] is
/// called, which makes test interleavings explicit.
///
/// [`run_pending`]: EventQueue::run_pending
#[derive(Default)]
pub struct EventQueue {
    /// Callbacks in submission order.
    pending: RefCell<VecDeque<Event>>,
}

impl EventQueue {
    /// Constructs an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs queued events until the queue is empty.
    ///
    /// Events scheduled by a running event are drained in the same call.
    /// Returns the number of events run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // Pop before running so an event can schedule more.
            let event = match self.pending.borrow_mut().pop_front() {
                Some(event) => event,
                None => return ran,
            };
            trace!(name = event.name, "running scheduled event");
            (event.f)();
            ran += 1;
        }
    }

    /// Returns the number of events waiting to run.
    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Checks whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }
}

impl Events for EventQueue {
    fn schedule(&self, name: &'static str, f: Box<dyn FnOnce()>) {
        trace!(name, "scheduling event");
        self.pending.borrow_mut().push_back(Event { name, f });
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn runs_in_submission_order() {
        let queue = EventQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = Rc::clone(&order);
            queue.schedule("test", Box::new(move || order.borrow_mut().push(i)));
        }

        assert_eq!(queue.run_pending(), 3);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drains_nested_events() {
        let queue = Rc::new(EventQueue::new());
        let hits = Rc::new(RefCell::new(0));

        let inner_queue = Rc::clone(&queue);
        let inner_hits = Rc::clone(&hits);
        queue.schedule(
            "outer",
            Box::new(move || {
                let hits = Rc::clone(&inner_hits);
                inner_queue.schedule("inner", Box::new(move || *hits.borrow_mut() += 1));
            }),
        );

        assert_eq!(queue.run_pending(), 2);
        assert_eq!(*hits.borrow(), 1);
    }
}
