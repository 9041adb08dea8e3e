//! The controller facade (C6), the YAML command-list loader and environment-layered config, and
//! the built-in invocation recorder and subscribers -- the pieces that sit between an external
//! front-end and the scheduler/executor/event-bus core.

mod config;
mod facade;
mod recorder;
pub mod subscribers;
mod yaml;

pub use config::from_env;
pub use facade::{Controller, ControllerOutcome};
pub use recorder::InvocationRecorder;
pub use yaml::{load_commands, load_commands_from_path};

use std::sync::Arc;

use smelt_events::{EventBus, TraceId};
use smelt_execute::Executor;
use smelt_proto::ConfigureSmelt;

/// Everything a single invocation needs wired together: a controller, the event bus it publishes
/// to, and a trace id stamped on every event the invocation produces.
pub struct Session {
    pub controller: Controller,
    pub bus: EventBus,
    pub trace_id: TraceId,
}

impl Session {
    pub fn new(executor: Arc<dyn Executor>, config: ConfigureSmelt) -> Self {
        let bus = EventBus::new();
        let trace_id = TraceId::new();
        Session {
            controller: Controller::new(executor, bus.clone(), config),
            bus,
            trace_id,
        }
    }

    /// Closes the bus. Every subscriber's `is_done()` will flip true once it drains whatever was
    /// already queued.
    pub fn finish(&self) {
        self.bus.close();
    }
}
