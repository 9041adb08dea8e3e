use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use smelt_events::{CommandEventVariant, EventPayload, EventStream};

/// Tracks the process-level return code a CLI front-end should exit with: 0 unless some command
/// finished with a non-zero exit code, in which case it latches the first one observed.
#[derive(Clone)]
pub struct RetcodeSubscriber {
    code: Arc<AtomicI32>,
}

impl RetcodeSubscriber {
    pub fn new() -> Self {
        RetcodeSubscriber { code: Arc::new(AtomicI32::new(0)) }
    }

    pub fn retcode(&self) -> i32 {
        self.code.load(Ordering::Acquire)
    }

    pub async fn watch(&self, stream: EventStream) {
        loop {
            match stream.try_pop() {
                Some(event) => {
                    if let EventPayload::Command(c) = event.payload {
                        if let CommandEventVariant::Finished { exit_code, .. } = c.variant {
                            if exit_code != 0 {
                                let _ = self.code.compare_exchange(0, exit_code, Ordering::AcqRel, Ordering::Acquire);
                            }
                        }
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

impl Default for RetcodeSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smelt_events::{Event, EventBus, TestOutputs, TraceId};

    #[tokio::test]
    async fn latches_the_first_non_zero_exit_code() {
        let bus = EventBus::new();
        let stream = bus.subscribe();
        let subscriber = RetcodeSubscriber::new();

        let trace_id = TraceId::new();
        bus.publish(Event::command(
            trace_id,
            "a",
            CommandEventVariant::Finished { exit_code: 7, outputs: TestOutputs::default(), command_type: "test".to_owned() },
        ));
        bus.close();
        subscriber.watch(stream).await;

        assert_eq!(subscriber.retcode(), 7);
    }
}
