use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::model::Event;

/// Fan-out point for lifecycle events (C1). A single publisher -- the scheduler -- hands events
/// to every subscriber's own unbounded queue; a slow or stalled subscriber never blocks the
/// publisher and never blocks any other subscriber.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

struct Inner {
    subscribers: Mutex<Vec<crossbeam_channel::Sender<Event>>>,
    closed: Arc<AtomicBool>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                closed: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Registers a new subscriber. Subscribing after [`EventBus::close`] returns a stream that is
    /// already done: there is nothing left to publish.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = crossbeam_channel::unbounded();
        if !self.inner.closed.load(Ordering::Acquire) {
            self.inner.subscribers.lock().unwrap().push(tx);
        }
        EventStream {
            rx,
            closed: self.inner.closed.clone(),
        }
    }

    /// Publishes `event` to every live subscriber. Dropped subscribers are pruned here rather
    /// than left to accumulate. A no-op once the bus is closed.
    pub fn publish(&self, event: Event) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        event.trace();
        let mut subs = self.inner.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Marks the bus closed and drops every sender. Each subscriber's receiver keeps draining
    /// whatever is already queued, then reports `is_done()` once empty -- it never errors out
    /// from under a consumer mid-drain.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.subscribers.lock().unwrap().clear();
    }
}

/// One subscriber's view of the bus: an independent, totally-ordered FIFO queue of events.
pub struct EventStream {
    rx: crossbeam_channel::Receiver<Event>,
    closed: Arc<AtomicBool>,
}

/// Returned by [`EventStream::pop_blocking`] once the bus has closed and this stream's queue has
/// been fully drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event stream closed")]
pub struct EventStreamClosed;

impl EventStream {
    /// Blocks until an event is available or the stream is done.
    pub fn pop_blocking(&self) -> Result<Event, EventStreamClosed> {
        self.rx.recv().map_err(|_| EventStreamClosed)
    }

    /// Returns an event if one is already queued, without blocking.
    pub fn try_pop(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// True once the bus is closed and this stream has nothing left queued. A subscriber that
    /// polls this in a loop will observe it flip exactly once, after draining everything
    /// published before `close()`.
    pub fn is_done(&self) -> bool {
        self.closed.load(Ordering::Acquire) && self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommandEventVariant, InvokeEventVariant};
    use crate::trace::TraceId;

    #[test]
    fn subscriber_sees_events_in_publish_order() {
        let bus = EventBus::new();
        let stream = bus.subscribe();
        let trace_id = TraceId::new();
        bus.publish(Event::command(trace_id, "a", CommandEventVariant::Scheduled));
        bus.publish(Event::command(trace_id, "a", CommandEventVariant::Started));

        let first = stream.pop_blocking().unwrap();
        let second = stream.pop_blocking().unwrap();
        assert_eq!(first.payload, Event::command(trace_id, "a", CommandEventVariant::Scheduled).payload);
        assert_eq!(second.payload, Event::command(trace_id, "a", CommandEventVariant::Started).payload);
    }

    #[test]
    fn two_subscribers_each_get_every_event() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(Event::invoke(TraceId::new(), InvokeEventVariant::Done));

        assert!(a.try_pop().is_some());
        assert!(b.try_pop().is_some());
    }

    #[test]
    fn close_drains_then_marks_done() {
        let bus = EventBus::new();
        let stream = bus.subscribe();
        bus.publish(Event::invoke(TraceId::new(), InvokeEventVariant::Done));
        bus.close();

        assert!(!stream.is_done(), "queued event must be drained first");
        stream.pop_blocking().unwrap();
        assert!(stream.is_done());
    }

    #[test]
    fn publish_after_close_is_a_no_op() {
        let bus = EventBus::new();
        let stream = bus.subscribe();
        bus.close();
        bus.publish(Event::invoke(TraceId::new(), InvokeEventVariant::Done));

        assert!(stream.is_done());
        assert!(stream.try_pop().is_none());
    }

    #[test]
    fn dropped_subscriber_is_pruned_on_next_publish() {
        let bus = EventBus::new();
        {
            let _transient = bus.subscribe();
        }
        // Must not panic or block even though the transient subscriber's receiver is gone.
        bus.publish(Event::invoke(TraceId::new(), InvokeEventVariant::Done));
        assert_eq!(bus.inner.subscribers.lock().unwrap().len(), 0);
    }

    #[test]
    fn subscribing_after_close_returns_an_already_done_stream() {
        let bus = EventBus::new();
        bus.close();
        let stream = bus.subscribe();
        assert!(stream.is_done());
    }
}
