use smelt_events::{CommandEventVariant, EventPayload, EventStream};

/// Mirrors every command's stdout to this process's own stdout as it streams in, prefixed by the
/// command's name. A minimal stand-in for whatever richer terminal UI a real front-end provides.
pub struct StdoutSubscriber;

impl StdoutSubscriber {
    pub async fn watch(stream: EventStream) {
        loop {
            match stream.try_pop() {
                Some(event) => {
                    if let EventPayload::Command(c) = event.payload {
                        if let CommandEventVariant::Stdout(bytes) = c.variant {
                            print!("[{}] {}", c.command_ref, String::from_utf8_lossy(&bytes));
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
