use std::time::SystemTime;

use bytes::Bytes;
use smelt_proto::{
    command_event, event, invoke_event, AllCommandsDone, CommandCancelled, CommandFinished,
    CommandProfile, CommandScheduled, CommandSkipped, CommandStarted, CommandStdout, CommandWarn,
    ExecutionStart as ProtoExecutionStart, SetGraph, SmeltErrorType, TestOutputs as ProtoTestOutputs,
};

use crate::trace::TraceId;

/// Outputs recorded for one finished command: the artifact paths it produced and its exit code.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TestOutputs {
    pub artifacts: Vec<String>,
    pub exit_code: i32,
}

impl From<TestOutputs> for ProtoTestOutputs {
    fn from(t: TestOutputs) -> Self {
        ProtoTestOutputs {
            artifacts: t.artifacts,
            exit_code: t.exit_code,
        }
    }
}

impl From<ProtoTestOutputs> for TestOutputs {
    fn from(t: ProtoTestOutputs) -> Self {
        TestOutputs {
            artifacts: t.artifacts,
            exit_code: t.exit_code,
        }
    }
}

/// One transition of a single command's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEventVariant {
    Scheduled,
    Started,
    Cancelled,
    Skipped,
    Stdout(Bytes),
    Profile {
        memory_used_bytes: u64,
        cpu_load: f32,
    },
    Finished {
        exit_code: i32,
        outputs: TestOutputs,
        command_type: String,
    },
    /// Carries a non-fatal anomaly (e.g. a non-finite profiler sample) off the executor's
    /// per-command channel. Never published on the bus as a `CommandEvent` -- the scheduler
    /// rewrites it into a top-level `SmeltErrorEvent{kind: InternalWarn}` before publishing.
    Warn(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandEvent {
    pub command_ref: String,
    pub variant: CommandEventVariant,
}

/// Metadata recorded once per run, at `InvokeEvent::Start`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionStart {
    pub smelt_root: String,
    pub username: String,
    pub hostname: String,
    pub git_hash: String,
    pub git_repo: String,
    pub git_branch: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvokeEventVariant {
    Start(ExecutionStart),
    Done,
    SetGraph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmeltErrorKind {
    ClientError,
    InternalError,
    InternalWarn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmeltErrorEvent {
    pub kind: SmeltErrorKind,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Command(CommandEvent),
    Invoke(InvokeEventVariant),
    Error(SmeltErrorEvent),
}

/// A single wire-level event: a trace id, a wall-clock timestamp, and one of the three payload
/// families. This is the Rust-native counterpart of `smelt_proto::Event`; conversion to and from
/// the protobuf form is what the wire codec (C8) actually does.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub time: SystemTime,
    pub trace_id: TraceId,
    pub payload: EventPayload,
}

impl Event {
    pub fn command(trace_id: TraceId, command_ref: impl Into<String>, variant: CommandEventVariant) -> Self {
        Event {
            time: SystemTime::now(),
            trace_id,
            payload: EventPayload::Command(CommandEvent {
                command_ref: command_ref.into(),
                variant,
            }),
        }
    }

    pub fn invoke(trace_id: TraceId, variant: InvokeEventVariant) -> Self {
        Event {
            time: SystemTime::now(),
            trace_id,
            payload: EventPayload::Invoke(variant),
        }
    }

    pub fn error(trace_id: TraceId, kind: SmeltErrorKind, payload: impl Into<String>) -> Self {
        Event {
            time: SystemTime::now(),
            trace_id,
            payload: EventPayload::Error(SmeltErrorEvent {
                kind,
                payload: payload.into(),
            }),
        }
    }

    /// Mirrors this event to `tracing`, independent of whatever subscribers are on the bus.
    pub fn trace(&self) {
        match &self.payload {
            EventPayload::Error(err) => match err.kind {
                SmeltErrorKind::ClientError | SmeltErrorKind::InternalError => {
                    tracing::error!(trace_id = %self.trace_id, payload = %err.payload, "smelt error");
                }
                SmeltErrorKind::InternalWarn => {
                    tracing::warn!(trace_id = %self.trace_id, payload = %err.payload, "smelt warning");
                }
            },
            EventPayload::Command(c) => {
                tracing::debug!(trace_id = %self.trace_id, command = %c.command_ref, variant = ?c.variant, "command event");
            }
            EventPayload::Invoke(v) => {
                tracing::debug!(trace_id = %self.trace_id, variant = ?v, "invoke event");
            }
        }
    }
}

impl From<Event> for smelt_proto::Event {
    fn from(e: Event) -> Self {
        let time = Some(prost_types::Timestamp::from(e.time));
        let et = match e.payload {
            EventPayload::Command(c) => event::Et::Command(c.into()),
            EventPayload::Invoke(i) => event::Et::Invoke(i.into()),
            EventPayload::Error(err) => event::Et::Error(err.into()),
        };
        smelt_proto::Event {
            time,
            trace_id: e.trace_id.to_string(),
            et: Some(et),
        }
    }
}

/// Errors converting a wire-level `smelt_proto::Event` back into our native [`Event`]: the oneof
/// was empty, or the `trace_id` field was not a valid UUID.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("event is missing its payload")]
    MissingPayload,
    #[error("event has no timestamp")]
    MissingTimestamp,
    #[error("event timestamp is out of range")]
    InvalidTimestamp,
    #[error("invalid trace id: {0}")]
    InvalidTraceId(#[from] uuid::Error),
}

impl TryFrom<smelt_proto::Event> for Event {
    type Error = DecodeError;

    fn try_from(e: smelt_proto::Event) -> Result<Self, Self::Error> {
        let trace_id: TraceId = e.trace_id.parse()?;
        let time: SystemTime = e
            .time
            .ok_or(DecodeError::MissingTimestamp)?
            .try_into()
            .map_err(|_| DecodeError::InvalidTimestamp)?;
        let payload = match e.et.ok_or(DecodeError::MissingPayload)? {
            event::Et::Command(c) => EventPayload::Command(c.try_into()?),
            event::Et::Invoke(i) => EventPayload::Invoke(i.try_into()?),
            event::Et::Error(err) => EventPayload::Error(err.into()),
        };
        Ok(Event { time, trace_id, payload })
    }
}

impl From<CommandEvent> for smelt_proto::CommandEvent {
    fn from(c: CommandEvent) -> Self {
        let variant = match c.variant {
            CommandEventVariant::Scheduled => command_event::Variant::Scheduled(CommandScheduled {}),
            CommandEventVariant::Started => command_event::Variant::Started(CommandStarted {}),
            CommandEventVariant::Cancelled => command_event::Variant::Cancelled(CommandCancelled {}),
            CommandEventVariant::Skipped => command_event::Variant::Skipped(CommandSkipped {}),
            CommandEventVariant::Stdout(bytes) => {
                command_event::Variant::Stdout(CommandStdout { output: bytes })
            }
            CommandEventVariant::Profile {
                memory_used_bytes,
                cpu_load,
            } => command_event::Variant::Profile(CommandProfile {
                memory_used_bytes,
                cpu_load,
            }),
            CommandEventVariant::Finished {
                exit_code,
                outputs,
                command_type,
            } => command_event::Variant::Finished(CommandFinished {
                exit_code,
                outputs: Some(outputs.into()),
                command_type,
            }),
            CommandEventVariant::Warn(payload) => command_event::Variant::Warn(CommandWarn { payload }),
        };
        smelt_proto::CommandEvent {
            command_ref: c.command_ref,
            variant: Some(variant),
        }
    }
}

impl TryFrom<smelt_proto::CommandEvent> for CommandEvent {
    type Error = DecodeError;

    fn try_from(c: smelt_proto::CommandEvent) -> Result<Self, Self::Error> {
        let variant = match c.variant.ok_or(DecodeError::MissingPayload)? {
            command_event::Variant::Scheduled(_) => CommandEventVariant::Scheduled,
            command_event::Variant::Started(_) => CommandEventVariant::Started,
            command_event::Variant::Cancelled(_) => CommandEventVariant::Cancelled,
            command_event::Variant::Skipped(_) => CommandEventVariant::Skipped,
            command_event::Variant::Stdout(s) => CommandEventVariant::Stdout(s.output),
            command_event::Variant::Profile(p) => CommandEventVariant::Profile {
                memory_used_bytes: p.memory_used_bytes,
                cpu_load: p.cpu_load,
            },
            command_event::Variant::Finished(f) => CommandEventVariant::Finished {
                exit_code: f.exit_code,
                outputs: f.outputs.map(TestOutputs::from).unwrap_or_default(),
                command_type: f.command_type,
            },
            command_event::Variant::Warn(w) => CommandEventVariant::Warn(w.payload),
        };
        Ok(CommandEvent {
            command_ref: c.command_ref,
            variant,
        })
    }
}

impl From<InvokeEventVariant> for smelt_proto::InvokeEvent {
    fn from(v: InvokeEventVariant) -> Self {
        let variant = match v {
            InvokeEventVariant::Start(start) => invoke_event::Variant::Start(ProtoExecutionStart {
                smelt_root: start.smelt_root,
                username: start.username,
                hostname: start.hostname,
                git_hash: start.git_hash,
                git_repo: start.git_repo,
                git_branch: start.git_branch,
            }),
            InvokeEventVariant::Done => invoke_event::Variant::Done(AllCommandsDone {}),
            InvokeEventVariant::SetGraph => invoke_event::Variant::Set(SetGraph {}),
        };
        smelt_proto::InvokeEvent {
            variant: Some(variant),
        }
    }
}

impl TryFrom<smelt_proto::InvokeEvent> for InvokeEventVariant {
    type Error = DecodeError;

    fn try_from(v: smelt_proto::InvokeEvent) -> Result<Self, Self::Error> {
        Ok(match v.variant.ok_or(DecodeError::MissingPayload)? {
            invoke_event::Variant::Start(s) => InvokeEventVariant::Start(ExecutionStart {
                smelt_root: s.smelt_root,
                username: s.username,
                hostname: s.hostname,
                git_hash: s.git_hash,
                git_repo: s.git_repo,
                git_branch: s.git_branch,
            }),
            invoke_event::Variant::Done(_) => InvokeEventVariant::Done,
            invoke_event::Variant::Set(_) => InvokeEventVariant::SetGraph,
        })
    }
}

impl From<SmeltErrorEvent> for smelt_proto::SmeltError {
    fn from(e: SmeltErrorEvent) -> Self {
        let sig = match e.kind {
            SmeltErrorKind::ClientError => SmeltErrorType::ClientError,
            SmeltErrorKind::InternalError => SmeltErrorType::InternalError,
            SmeltErrorKind::InternalWarn => SmeltErrorType::InternalWarn,
        };
        smelt_proto::SmeltError {
            sig: sig as i32,
            error_payload: e.payload,
        }
    }
}

impl From<smelt_proto::SmeltError> for SmeltErrorEvent {
    fn from(e: smelt_proto::SmeltError) -> Self {
        let kind = match SmeltErrorType::try_from(e.sig).unwrap_or(SmeltErrorType::InternalError) {
            SmeltErrorType::ClientError => SmeltErrorKind::ClientError,
            SmeltErrorType::InternalError => SmeltErrorKind::InternalError,
            SmeltErrorType::InternalWarn => SmeltErrorKind::InternalWarn,
        };
        SmeltErrorEvent {
            kind,
            payload: e.error_payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_event_round_trips_through_proto() {
        let trace_id = TraceId::new();
        let event = Event::command(
            trace_id,
            "a",
            CommandEventVariant::Finished {
                exit_code: 0,
                outputs: TestOutputs {
                    artifacts: vec!["out.txt".to_owned()],
                    exit_code: 0,
                },
                command_type: "test".to_owned(),
            },
        );
        let proto: smelt_proto::Event = event.clone().into();
        let back: Event = proto.try_into().unwrap();
        assert_eq!(event.trace_id, back.trace_id);
        assert_eq!(event.payload, back.payload);
    }

    #[test]
    fn invoke_done_round_trips() {
        let trace_id = TraceId::new();
        let event = Event::invoke(trace_id, InvokeEventVariant::Done);
        let proto: smelt_proto::Event = event.clone().into();
        let back: Event = proto.try_into().unwrap();
        assert_eq!(event.payload, back.payload);
    }

    #[test]
    fn error_event_round_trips() {
        let trace_id = TraceId::new();
        let event = Event::error(trace_id, SmeltErrorKind::InternalWarn, "non-finite sample");
        let proto: smelt_proto::Event = event.clone().into();
        let back: Event = proto.try_into().unwrap();
        assert_eq!(event.payload, back.payload);
    }
}
