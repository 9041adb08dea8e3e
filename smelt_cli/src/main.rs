//! A thin demonstration front-end for smelt's controller facade (C6). Not part of the core
//! contract -- a real target-rule loader or IDE integration talks to [`smelt_server::Session`]
//! directly instead of shelling out to this binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use smelt_execute::{Docker, DockerUlimit, Executor, Local};
use smelt_proto::{configure_smelt, ConfigureSmelt};
use smelt_server::{load_commands_from_path, Session};
use smelt_types::TargetType;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "smelt", about = "Dependency-aware command scheduler")]
struct Cli {
    /// Root of the command graph this invocation operates under.
    #[arg(long, default_value = ".")]
    smelt_root: PathBuf,

    /// Path to a YAML command list (§6 format) to load before running anything.
    #[arg(long)]
    commands: PathBuf,

    /// Maximum number of commands to run concurrently.
    #[arg(long, default_value_t = 4)]
    job_slots: u64,

    /// Only execute `test`-typed commands and whatever they depend on.
    #[arg(long)]
    test_only: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Run a single named command and everything it depends on.
    RunOne { name: String },
    /// Run several named commands and everything they depend on.
    RunMany { names: Vec<String> },
    /// Run every command of a given target type.
    RunType { type_name: String },
    /// Run every non-rebuild/rerun command in the graph.
    RunAll,
}

/// Builds the executor `config.init_executor` asks for -- `Local` when unset or explicitly
/// `CfgLocal`, `Docker` when `CfgDocker` names an image.
fn build_executor(config: &ConfigureSmelt) -> Arc<dyn Executor> {
    match &config.init_executor {
        Some(configure_smelt::InitExecutor::Docker(docker)) => Arc::new(Docker {
            image: docker.image_name.clone(),
            additional_mounts: docker.additional_mounts.clone(),
            ulimits: docker
                .ulimits
                .iter()
                .map(|u| DockerUlimit {
                    name: u.name.clone(),
                    soft: u.soft as i64,
                    hard: u.hard as i64,
                })
                .collect(),
        }),
        _ => Arc::new(Local::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let commands = load_commands_from_path(&cli.commands)?;

    let config = smelt_server::from_env(ConfigureSmelt {
        smelt_root: cli.smelt_root.display().to_string(),
        job_slots: cli.job_slots,
        test_only: cli.test_only,
        ..Default::default()
    });
    let executor = build_executor(&config);

    let session = Session::new(executor, config);

    let stdout_stream = session.bus.subscribe();
    let stdout_task = tokio::spawn(smelt_server::subscribers::StdoutSubscriber::watch(stdout_stream));

    let yaml = serde_yaml::to_string(&commands)?;
    session
        .controller
        .handle(
            session.trace_id,
            smelt_proto::ClientCommand {
                client_commands: Some(smelt_proto::client_command::ClientCommands::Setter(smelt_proto::SetCommands {
                    command_content: yaml,
                })),
            },
            CancellationToken::new(),
        )
        .await?;

    let cancellation = CancellationToken::new();
    let summary = match cli.action {
        Action::RunOne { name } => session.controller.handle(
            session.trace_id,
            smelt_proto::ClientCommand {
                client_commands: Some(smelt_proto::client_command::ClientCommands::Runone(smelt_proto::RunOne { command_name: name })),
            },
            cancellation,
        ).await?,
        Action::RunMany { names } => session.controller.handle(
            session.trace_id,
            smelt_proto::ClientCommand {
                client_commands: Some(smelt_proto::client_command::ClientCommands::Runmany(smelt_proto::RunMany { command_names: names })),
            },
            cancellation,
        ).await?,
        Action::RunType { type_name } => {
            let _: TargetType = type_name.parse()?;
            session.controller.handle(
                session.trace_id,
                smelt_proto::ClientCommand {
                    client_commands: Some(smelt_proto::client_command::ClientCommands::Runtype(smelt_proto::RunType { typeinfo: type_name })),
                },
                cancellation,
            ).await?
        }
        Action::RunAll => {
            let stream = session.bus.subscribe();
            let summary = session.controller.run_all(session.trace_id, cancellation).await?;
            smelt_server::ControllerOutcome::Run { stream, summary }
        }
    };

    session.finish();
    stdout_task.await?;

    match summary {
        smelt_server::ControllerOutcome::Run { summary, .. } => {
            if summary.all_passed() {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        _ => Ok(()),
    }
}
