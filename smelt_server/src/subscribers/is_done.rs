use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smelt_events::{EventPayload, EventStream, InvokeEventVariant};

/// Flips to `true` the moment `InvokeEvent::Done` crosses the bus. Mirrors the original
/// `IsDoneSubscriber`, used by front-ends that just want to know when a run has finished without
/// tracking every command individually.
#[derive(Clone)]
pub struct IsDoneSubscriber {
    done: Arc<AtomicBool>,
}

impl IsDoneSubscriber {
    pub fn new() -> Self {
        IsDoneSubscriber { done: Arc::new(AtomicBool::new(false)) }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Drains `stream` until the bus closes or `InvokeEvent::Done` is observed.
    pub async fn watch(&self, stream: EventStream) {
        loop {
            match stream.try_pop() {
                Some(event) => {
                    if matches!(event.payload, EventPayload::Invoke(InvokeEventVariant::Done)) {
                        self.done.store(true, Ordering::Release);
                    }
                }
                None => {
                    if stream.is_done() {
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    }
}

impl Default for IsDoneSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smelt_events::{Event, EventBus, TraceId};

    #[tokio::test]
    async fn flips_true_once_the_run_is_done() {
        let bus = EventBus::new();
        let stream = bus.subscribe();
        let subscriber = IsDoneSubscriber::new();

        bus.publish(Event::invoke(TraceId::new(), InvokeEventVariant::Done));
        bus.close();
        subscriber.watch(stream).await;

        assert!(subscriber.is_done());
    }
}
