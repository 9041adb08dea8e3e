//! The controller facade (C6): the single entry point a front-end (the target-rule loader, a
//! CLI, or any other external collaborator per §6) drives over an in-process channel. It owns the
//! currently-installed [`Graph`] and hands every run off to a fresh [`Scheduler`].

use std::sync::Arc;

use smelt_events::{Event, EventBus, EventStream, InvokeEventVariant, SmeltErrorKind, TraceId};
use smelt_execute::Executor;
use smelt_graph::Graph;
use smelt_proto::{client_command, client_resp, ClientCommand, ClientResp, ConfigureSmelt};
use smelt_scheduler::{RunSummary, Scheduler, SchedulerConfig};
use smelt_types::{ClientError, TargetType};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::yaml;

/// What a handled [`ClientCommand`] produced: either a wire-level response (for `GetConfig`), a
/// run's event stream alongside its final per-command statuses, or acknowledgement of a graph
/// install.
pub enum ControllerOutcome {
    Config(ClientResp),
    Run { stream: EventStream, summary: RunSummary },
    GraphInstalled,
}

pub struct Controller {
    graph: RwLock<Option<Graph>>,
    config: RwLock<ConfigureSmelt>,
    executor: Arc<dyn Executor>,
    bus: EventBus,
}

impl Controller {
    pub fn new(executor: Arc<dyn Executor>, bus: EventBus, config: ConfigureSmelt) -> Self {
        Controller {
            graph: RwLock::new(None),
            config: RwLock::new(config::from_env(config)),
            executor,
            bus,
        }
    }

    pub async fn handle(&self, trace_id: TraceId, command: ClientCommand, cancellation: CancellationToken) -> anyhow::Result<ControllerOutcome> {
        match command.client_commands {
            Some(client_command::ClientCommands::Setter(set)) => {
                self.set_commands(trace_id, &set.command_content).await?;
                Ok(ControllerOutcome::GraphInstalled)
            }
            Some(client_command::ClientCommands::Runone(one)) => {
                let stream = self.bus.subscribe();
                let scheduler = self.scheduler().await?;
                let summary = scheduler.run_one(trace_id, &one.command_name, cancellation).await?;
                Ok(ControllerOutcome::Run { stream, summary })
            }
            Some(client_command::ClientCommands::Runmany(many)) => {
                let stream = self.bus.subscribe();
                let scheduler = self.scheduler().await?;
                let summary = scheduler.run_many(trace_id, &many.command_names, cancellation).await?;
                Ok(ControllerOutcome::Run { stream, summary })
            }
            Some(client_command::ClientCommands::Runtype(run_type)) => {
                let kind: TargetType = run_type.typeinfo.parse()?;
                let stream = self.bus.subscribe();
                let scheduler = self.scheduler().await?;
                let summary = scheduler.run_type(trace_id, kind, cancellation).await?;
                Ok(ControllerOutcome::Run { stream, summary })
            }
            Some(client_command::ClientCommands::Getcfg(_)) => {
                let cfg = self.config.read().await.clone();
                Ok(ControllerOutcome::Config(ClientResp {
                    client_responses: Some(client_resp::ClientResponses::CurrentCfg(cfg)),
                }))
            }
            None => Err(ClientError::MalformedInput("empty ClientCommand".to_owned()).into()),
        }
    }

    /// Runs every non-rebuild/rerun command in the installed graph.
    pub async fn run_all(&self, trace_id: TraceId, cancellation: CancellationToken) -> anyhow::Result<RunSummary> {
        let scheduler = self.scheduler().await?;
        scheduler.run_all(trace_id, cancellation).await
    }

    /// Never silent: a malformed command list is always surfaced as a `ClientError` event before
    /// the error is handed back to the caller.
    async fn set_commands(&self, trace_id: TraceId, yaml_content: &str) -> anyhow::Result<()> {
        match self.install(yaml_content).await {
            Ok(()) => {
                self.bus.publish(Event::invoke(trace_id, InvokeEventVariant::SetGraph));
                Ok(())
            }
            Err(e) => {
                self.bus.publish(Event::error(trace_id, SmeltErrorKind::ClientError, e.to_string()));
                Err(e)
            }
        }
    }

    async fn install(&self, yaml_content: &str) -> anyhow::Result<()> {
        let mut commands = yaml::load_commands(yaml_content)?;
        let smelt_root = self.config.read().await.smelt_root.clone();
        for command in &mut commands {
            if command.working_dir.is_empty() {
                command.working_dir = smelt_root.clone();
            }
        }
        let graph = Graph::install(commands)?;
        *self.graph.write().await = Some(graph);
        Ok(())
    }

    async fn scheduler(&self) -> anyhow::Result<Scheduler> {
        let graph = self.graph.read().await.clone().ok_or_else(|| {
            ClientError::MalformedInput("no command graph installed; send SetCommands first".to_owned())
        })?;
        let config = self.config.read().await.clone();
        Ok(Scheduler::new(
            graph,
            self.executor.clone(),
            self.bus.clone(),
            config.smelt_root.clone(),
            SchedulerConfig {
                job_slots: (config.job_slots.max(1)) as usize,
                test_only: config.test_only,
            },
        ))
    }
}
