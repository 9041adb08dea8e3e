//! Command execution (C3) and the sampling profiler (C4).
//!
//! Everything a scheduler needs from an executor is captured by the single-method [`Executor`]
//! trait: hand it a request, get back a stream of lifecycle events and a handle to await the
//! final outcome. `Local` runs commands as bare subprocesses; `Docker` runs them inside a
//! resource-limited container. Neither backend waits for anything other than the command itself
//! to finish -- grandchildren left running in the background are never waited on.

mod docker;
mod local;
mod profiler;
mod script;

pub use docker::{Docker, DockerUlimit};
pub use local::Local;
pub use profiler::{sample_subtree, ProcessSample, Profiler};

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use smelt_events::CommandEventVariant;
use smelt_types::RuntimeRequirements;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything an executor needs to run one command.
pub struct ExecutionRequest {
    pub command_ref: String,
    pub script: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    /// The session's root, used to set `SMELT_ROOT`/`TARGET_ROOT` in the child's environment
    /// regardless of where this particular command's `working_dir` points.
    pub smelt_root: String,
    pub runtime: RuntimeRequirements,
    /// Cancelled by the scheduler to request early termination (user cancel, or a sibling
    /// failure with no surviving `on_failure` peer). The executor owns turning this into
    /// SIGTERM-then-SIGKILL.
    pub cancellation: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Finished { exit_code: i32 },
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub stdout: Vec<u8>,
}

/// A running command: a stream of lifecycle events (stdout chunks, profile samples) and a handle
/// to the task producing the final [`ExecutionOutcome`].
pub struct ExecutionHandle {
    pub events: mpsc::UnboundedReceiver<CommandEventVariant>,
    pub result: tokio::task::JoinHandle<anyhow::Result<ExecutionOutcome>>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> anyhow::Result<ExecutionHandle>;
}
