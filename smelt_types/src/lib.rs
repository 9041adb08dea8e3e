//! The typed command model: [`Command`], its [`RuntimeRequirements`], and the per-command
//! [`CommandState`] machine the scheduler drives. Nothing in this crate touches a filesystem or
//! a process -- it only describes what a command *is*.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A command's identity within a graph. Graphs refer to each other only by name.
pub type CommandRef = String;

/// Tag used by `run_type` selection and the rerun/rebuild protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Test,
    Build,
    Stimulus,
    Rebuild,
    Rerun,
}

impl TargetType {
    /// `run_type` never selects these directly -- they only appear via `on_failure`.
    pub fn is_rerun_variant(self) -> bool {
        matches!(self, TargetType::Rebuild | TargetType::Rerun)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TargetType::Test => "test",
            TargetType::Build => "build",
            TargetType::Stimulus => "stimulus",
            TargetType::Rebuild => "rebuild",
            TargetType::Rerun => "rerun",
        }
    }
}

impl std::str::FromStr for TargetType {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test" => Ok(TargetType::Test),
            "build" => Ok(TargetType::Build),
            "stimulus" => Ok(TargetType::Stimulus),
            "rebuild" => Ok(TargetType::Rebuild),
            "rerun" => Ok(TargetType::Rerun),
            other => Err(ClientError::UnknownTargetType(other.to_owned())),
        }
    }
}

/// Per-command resource budget and environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeRequirements {
    #[serde(default = "RuntimeRequirements::default_num_cpus")]
    pub num_cpus: u32,
    #[serde(default = "RuntimeRequirements::default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "RuntimeRequirements::default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl RuntimeRequirements {
    fn default_num_cpus() -> u32 {
        1
    }

    fn default_max_memory_mb() -> u64 {
        1024
    }

    fn default_timeout() -> u64 {
        600
    }
}

impl Default for RuntimeRequirements {
    fn default() -> Self {
        Self {
            num_cpus: Self::default_num_cpus(),
            max_memory_mb: Self::default_max_memory_mb(),
            timeout: Self::default_timeout(),
            env: HashMap::new(),
        }
    }
}

/// An atomic shell script unit with declared dependencies, resource limits, and outputs.
///
/// Immutable once installed into a [`smelt_graph::Graph`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: CommandRef,
    pub target_type: TargetType,
    pub script: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<CommandRef>,
    #[serde(default)]
    pub dependent_files: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub runtime: RuntimeRequirements,
    /// Optional -- defaults to the session's `smelt_root` when left empty. Left to the loader to
    /// backfill, since only it knows the session's `smelt_root`.
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub on_failure: Option<CommandRef>,
}

/// The state machine a command's row moves through. Mutated only by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandState {
    Pending,
    Scheduled,
    Started,
    Finished,
    Cancelled,
    Skipped,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Finished | CommandState::Cancelled | CommandState::Skipped
        )
    }
}

/// Tri-state summary classification, reused by the JUnit writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CStatus {
    Pass,
    Fail,
    Skipped,
}

/// Errors that are always the client's fault: malformed input, or a request that does not make
/// sense against the currently-installed graph. Delivered to subscribers as `SmeltError` events
/// with `kind = ClientError`, never raised as a panic or silently swallowed.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("duplicate command name: {0}")]
    DuplicateName(String),
    #[error("command {command} depends on unknown command {dependency}")]
    UnknownDependency { command: String, dependency: String },
    #[error("dependency cycle detected: {0}")]
    CycleDetected(String),
    #[error("duplicate output path {path}, declared by both {first} and {second}")]
    DuplicateOutput {
        path: String,
        first: String,
        second: String,
    },
    #[error("command {command} has on_failure referring to unknown command {target}")]
    UnknownOnFailure { command: String, target: String },
    #[error("malformed command list: {0}")]
    MalformedInput(String),
    #[error("unknown command name: {0}")]
    UnknownCommand(String),
    #[error("unknown target type: {0}")]
    UnknownTargetType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_requirements_default_matches_original() {
        let rt = RuntimeRequirements::default();
        assert_eq!(rt.num_cpus, 1);
        assert_eq!(rt.max_memory_mb, 1024);
        assert_eq!(rt.timeout, 600);
        assert!(rt.env.is_empty());
    }

    #[test]
    fn target_type_round_trips_through_str() {
        for (s, tt) in [
            ("test", TargetType::Test),
            ("build", TargetType::Build),
            ("stimulus", TargetType::Stimulus),
            ("rebuild", TargetType::Rebuild),
            ("rerun", TargetType::Rerun),
        ] {
            assert_eq!(s.parse::<TargetType>().unwrap(), tt);
            assert_eq!(tt.as_str(), s);
        }
        assert!("bogus".parse::<TargetType>().is_err());
    }

    #[test]
    fn command_deserializes_with_defaults() {
        let yaml = r#"
name: a
target_type: test
script:
  - "echo hi"
working_dir: /tmp/smelt
"#;
        let cmd: Command = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cmd.name, "a");
        assert!(cmd.dependencies.is_empty());
        assert_eq!(cmd.runtime.num_cpus, 1);
    }

    #[test]
    fn working_dir_is_optional_and_defaults_to_empty() {
        let yaml = r#"
name: a
target_type: test
script:
  - "echo hi"
"#;
        let cmd: Command = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cmd.working_dir, "");
    }

    #[test]
    fn rerun_variants_are_never_directly_selected() {
        assert!(TargetType::Rebuild.is_rerun_variant());
        assert!(TargetType::Rerun.is_rerun_variant());
        assert!(!TargetType::Test.is_rerun_variant());
    }
}
