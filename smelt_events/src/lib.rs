//! The lifecycle event model and fan-out bus (C1): every state transition the scheduler and
//! executor produce is expressed as an [`Event`] and published onto an [`EventBus`] that
//! multiplexes it out to an arbitrary number of independent subscribers.

mod bus;
mod model;
mod trace;

pub use bus::{EventBus, EventStream, EventStreamClosed};
pub use model::{
    CommandEvent, CommandEventVariant, DecodeError, Event, EventPayload, ExecutionStart,
    InvokeEventVariant, SmeltErrorEvent, SmeltErrorKind, TestOutputs,
};
pub use trace::TraceId;
