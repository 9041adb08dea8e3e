//! Built-in event-bus subscribers: small, single-purpose consumers that each watch the same event
//! stream for one thing and are cheap enough to always run alongside the invocation recorder.

mod is_done;
mod retcode;
mod stdout;

pub use is_done::IsDoneSubscriber;
pub use retcode::RetcodeSubscriber;
pub use stdout::StdoutSubscriber;
