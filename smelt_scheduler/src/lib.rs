//! The dependency-aware scheduler (C5): turns a [`smelt_graph::Graph`] and a target selection
//! into a bounded stream of running jobs, respecting job-slot admission control, skip
//! propagation, and `on_failure` peer scheduling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use smelt_events::{CommandEventVariant, Event, EventBus, ExecutionStart, InvokeEventVariant, SmeltErrorKind, TraceId};
use smelt_execute::{ExecutionRequest, ExecutionStatus, Executor};
use smelt_graph::{CommandIdx, Graph};
use smelt_types::{CStatus, ClientError, TargetType};
use tokio_util::sync::CancellationToken;

/// `ConfigureSmelt.test_only`: when set, only `Test` commands (and whatever they transitively
/// depend on) are actually executed -- everything else in the selected frontier is skipped.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub job_slots: usize,
    pub test_only: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { job_slots: 1, test_only: false }
    }
}

/// The terminal status of every command that was part of a run's selected frontier.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub statuses: HashMap<String, CStatus>,
}

impl RunSummary {
    /// True if nothing in the run failed (skips are not failures on their own).
    pub fn all_passed(&self) -> bool {
        self.statuses.values().all(|s| *s != CStatus::Fail)
    }
}

pub struct Scheduler {
    graph: Graph,
    executor: Arc<dyn Executor>,
    bus: EventBus,
    smelt_root: String,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(graph: Graph, executor: Arc<dyn Executor>, bus: EventBus, smelt_root: String, config: SchedulerConfig) -> Self {
        Scheduler { graph, executor, bus, smelt_root, config }
    }

    pub async fn run_one(&self, trace_id: TraceId, name: &str, cancellation: CancellationToken) -> anyhow::Result<RunSummary> {
        let idx = self.graph.idx_of(name).ok_or_else(|| ClientError::UnknownCommand(name.to_owned()))?;
        let mut frontier = self.graph.ancestors(idx);
        frontier.insert(idx);
        self.run_frontier(trace_id, frontier, cancellation).await
    }

    pub async fn run_many(&self, trace_id: TraceId, names: &[String], cancellation: CancellationToken) -> anyhow::Result<RunSummary> {
        let mut frontier = HashSet::new();
        for name in names {
            let idx = self.graph.idx_of(name).ok_or_else(|| ClientError::UnknownCommand(name.clone()))?;
            frontier.insert(idx);
            frontier.extend(self.graph.ancestors(idx));
        }
        self.run_frontier(trace_id, frontier, cancellation).await
    }

    pub async fn run_type(&self, trace_id: TraceId, kind: TargetType, cancellation: CancellationToken) -> anyhow::Result<RunSummary> {
        self.run_frontier(trace_id, self.graph.frontier_for_type(kind), cancellation).await
    }

    pub async fn run_all(&self, trace_id: TraceId, cancellation: CancellationToken) -> anyhow::Result<RunSummary> {
        self.run_frontier(trace_id, self.graph.frontier_all(), cancellation).await
    }

    async fn run_frontier(
        &self,
        trace_id: TraceId,
        mut frontier: HashSet<CommandIdx>,
        cancellation: CancellationToken,
    ) -> anyhow::Result<RunSummary> {
        self.bus.publish(Event::invoke(trace_id, InvokeEventVariant::Start(self.execution_start())));

        let test_indices = self.test_bearing_indices(&frontier);

        // `done` is every command that has reached a terminal status, of any kind -- it drives
        // admission exclusion and final bookkeeping. `satisfied` is the subset whose dependents
        // are actually allowed to proceed: a command that failed only joins it if its `on_failure`
        // peer later succeeds. `Graph::ready` is handed `satisfied`, never `done`, so a failed
        // command's direct successors never race ahead of its peer.
        let mut done: HashSet<CommandIdx> = HashSet::new();
        let mut satisfied: HashSet<CommandIdx> = HashSet::new();
        let mut statuses: HashMap<CommandIdx, CStatus> = HashMap::new();
        let mut running = FuturesUnordered::new();
        let mut job_tokens: HashMap<CommandIdx, CancellationToken> = HashMap::new();
        // peer idx -> the failed command it was scheduled to resolve.
        let mut pending_peer: HashMap<CommandIdx, CommandIdx> = HashMap::new();

        loop {
            if cancellation.is_cancelled() {
                for token in job_tokens.values() {
                    token.cancel();
                }
            }

            // Admit as many ready, non-running jobs as we have slots for.
            loop {
                if running.len() >= self.config.job_slots || cancellation.is_cancelled() {
                    break;
                }
                let exclude: HashSet<CommandIdx> = done.iter().chain(job_tokens.keys()).copied().collect();
                let ready = self.graph.ready(&satisfied, &exclude);
                let Some(idx) = ready
                    .into_iter()
                    .filter(|idx| frontier.contains(idx))
                    .find(|idx| !self.config.test_only || test_indices.contains(idx))
                else {
                    break;
                };

                let token = CancellationToken::new();
                job_tokens.insert(idx, token.clone());
                running.push(self.spawn(trace_id, idx, token));
            }

            // Anything still pending that test_only excludes is skipped outright, once it can no
            // longer gain a path to a test (i.e. once admission above has nothing left to pick).
            if running.is_empty() {
                let ready = self.graph.ready(&satisfied, &HashSet::new());
                let stragglers: Vec<CommandIdx> = ready
                    .into_iter()
                    .filter(|idx| frontier.contains(idx) && !done.contains(idx))
                    .filter(|idx| self.config.test_only && !test_indices.contains(idx))
                    .collect();
                if stragglers.is_empty() {
                    break;
                }
                for idx in stragglers {
                    self.skip(trace_id, idx, &mut done, &mut statuses);
                }
                continue;
            }

            let Some((idx, outcome)) = running.next().await else {
                break;
            };
            job_tokens.remove(&idx);

            let status = match outcome {
                Ok(outcome) => self.finish(trace_id, idx, outcome),
                Err(e) => {
                    tracing::error!(command = %self.graph.command(idx).name, error = %e, "executor failed");
                    self.bus.publish(Event::error(trace_id, smelt_events::SmeltErrorKind::InternalError, e.to_string()));
                    CStatus::Fail
                }
            };
            done.insert(idx);
            statuses.insert(idx, status);
            if status == CStatus::Pass {
                satisfied.insert(idx);
            }

            // `idx` may itself be an `on_failure` peer that a prior failure is waiting on --
            // resolve that failure now that the peer has a terminal status of its own.
            if let Some(failed) = pending_peer.remove(&idx) {
                if status == CStatus::Pass {
                    satisfied.insert(failed);
                } else {
                    self.skip_successors_of(trace_id, failed, &frontier, &mut done, &mut statuses);
                }
            }

            if status == CStatus::Fail {
                self.handle_failure(trace_id, idx, &mut frontier, &mut done, &mut statuses, &mut pending_peer);
            }
        }

        // Anything left in the frontier that never got a terminal status (e.g. cancelled before
        // it could even be admitted) is reported skipped rather than silently dropped.
        for idx in frontier.iter().copied().collect::<Vec<_>>() {
            if !done.contains(&idx) {
                self.skip(trace_id, idx, &mut done, &mut statuses);
            }
        }

        let named_statuses = statuses
            .into_iter()
            .map(|(idx, status)| (self.graph.command(idx).name.clone(), status))
            .collect();
        self.bus.publish(Event::invoke(trace_id, InvokeEventVariant::Done));
        Ok(RunSummary { statuses: named_statuses })
    }

    /// Metadata stamped once per run call, published as `InvokeEvent::Start`.
    fn execution_start(&self) -> ExecutionStart {
        ExecutionStart {
            smelt_root: self.smelt_root.clone(),
            username: std::env::var("USER").unwrap_or_default(),
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_default(),
            git_hash: String::new(),
            git_repo: String::new(),
            git_branch: String::new(),
        }
    }

    /// Commands that either are themselves `Test` or transitively feed one -- the set `test_only`
    /// keeps.
    fn test_bearing_indices(&self, frontier: &HashSet<CommandIdx>) -> HashSet<CommandIdx> {
        let mut keep = HashSet::new();
        for &idx in frontier {
            if self.graph.command(idx).target_type == TargetType::Test {
                keep.insert(idx);
                keep.extend(self.graph.ancestors(idx));
            }
        }
        keep
    }

    /// `failed` just reached `Fail`. If it names an `on_failure` peer, the peer is scheduled and
    /// `failed`'s own successors stay blocked until the peer resolves (see `pending_peer` in
    /// `run_frontier`). Otherwise `failed`'s successors are skipped immediately.
    fn handle_failure(
        &self,
        trace_id: TraceId,
        failed: CommandIdx,
        frontier: &mut HashSet<CommandIdx>,
        done: &mut HashSet<CommandIdx>,
        statuses: &mut HashMap<CommandIdx, CStatus>,
        pending_peer: &mut HashMap<CommandIdx, CommandIdx>,
    ) {
        if let Some(peer) = self.graph.on_failure(failed) {
            frontier.insert(peer);
            pending_peer.insert(peer, failed);
            return;
        }
        self.skip_successors_of(trace_id, failed, frontier, done, statuses);
    }

    fn skip_successors_of(
        &self,
        trace_id: TraceId,
        idx: CommandIdx,
        frontier: &HashSet<CommandIdx>,
        done: &mut HashSet<CommandIdx>,
        statuses: &mut HashMap<CommandIdx, CStatus>,
    ) {
        for successor in self.graph.transitive_successors(idx) {
            if frontier.contains(&successor) && !done.contains(&successor) {
                self.skip(trace_id, successor, done, statuses);
            }
        }
    }

    fn skip(&self, trace_id: TraceId, idx: CommandIdx, done: &mut HashSet<CommandIdx>, statuses: &mut HashMap<CommandIdx, CStatus>) {
        let name = self.graph.command(idx).name.clone();
        self.bus.publish(Event::command(trace_id, name, CommandEventVariant::Skipped));
        done.insert(idx);
        statuses.insert(idx, CStatus::Skipped);
        for successor in self.graph.transitive_successors(idx) {
            if !done.contains(&successor) {
                self.skip(trace_id, successor, done, statuses);
            }
        }
    }

    fn finish(&self, trace_id: TraceId, idx: CommandIdx, outcome: smelt_execute::ExecutionOutcome) -> CStatus {
        let command = self.graph.command(idx);
        let (exit_code, status) = match outcome.status {
            ExecutionStatus::Finished { exit_code } => (exit_code, if exit_code == 0 { CStatus::Pass } else { CStatus::Fail }),
            ExecutionStatus::TimedOut => (-1, CStatus::Fail),
            ExecutionStatus::Cancelled => (-1, CStatus::Fail),
        };
        self.bus.publish(Event::command(
            trace_id,
            command.name.clone(),
            CommandEventVariant::Finished {
                exit_code,
                outputs: smelt_events::TestOutputs {
                    artifacts: command.outputs.clone(),
                    exit_code,
                },
                command_type: command.target_type.as_str().to_owned(),
            },
        ));
        status
    }

    fn spawn(
        &self,
        trace_id: TraceId,
        idx: CommandIdx,
        cancellation: CancellationToken,
    ) -> impl std::future::Future<Output = (CommandIdx, anyhow::Result<smelt_execute::ExecutionOutcome>)> {
        let command = self.graph.command(idx).clone();
        let executor = self.executor.clone();
        let bus = self.bus.clone();
        let smelt_root = self.smelt_root.clone();

        bus.publish(Event::command(trace_id, command.name.clone(), CommandEventVariant::Scheduled));

        async move {
            bus.publish(Event::command(trace_id, command.name.clone(), CommandEventVariant::Started));

            let request = ExecutionRequest {
                command_ref: command.name.clone(),
                script: command.script.clone(),
                working_dir: command.working_dir.clone().into(),
                env: command.runtime.env.clone(),
                smelt_root,
                runtime: command.runtime.clone(),
                cancellation,
            };

            let result = match executor.execute(request).await {
                Ok(mut handle) => {
                    while let Some(event) = handle.events.recv().await {
                        match event {
                            // Never forwarded as a `CommandEvent` -- the executor uses this only
                            // to ferry a non-fatal anomaly off its per-command channel.
                            CommandEventVariant::Warn(payload) => {
                                bus.publish(Event::error(
                                    trace_id,
                                    SmeltErrorKind::InternalWarn,
                                    format!("{}: {payload}", command.name),
                                ));
                            }
                            other => {
                                bus.publish(Event::command(trace_id, command.name.clone(), other));
                            }
                        }
                    }
                    handle.result.await.map_err(anyhow::Error::from).and_then(|r| r)
                }
                Err(e) => Err(e),
            };
            (idx, result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use smelt_events::EventPayload;
    use smelt_execute::{ExecutionHandle, ExecutionOutcome, ExecutionRequest as Req};
    use smelt_types::{Command, RuntimeRequirements};
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::mpsc;

    struct AlwaysPasses;

    #[async_trait]
    impl Executor for AlwaysPasses {
        async fn execute(&self, _request: Req) -> anyhow::Result<ExecutionHandle> {
            let (_tx, rx) = mpsc::unbounded_channel();
            let result = tokio::spawn(async {
                Ok(ExecutionOutcome { status: ExecutionStatus::Finished { exit_code: 0 }, stdout: Vec::new() })
            });
            Ok(ExecutionHandle { events: rx, result })
        }
    }

    /// Exits with whatever code `exit_codes` maps a command's ref to, or 0 if unlisted.
    struct Scripted {
        exit_codes: StdHashMap<String, i32>,
    }

    #[async_trait]
    impl Executor for Scripted {
        async fn execute(&self, request: Req) -> anyhow::Result<ExecutionHandle> {
            let exit_code = self.exit_codes.get(&request.command_ref).copied().unwrap_or(0);
            let (_tx, rx) = mpsc::unbounded_channel();
            let result = tokio::spawn(async move {
                Ok(ExecutionOutcome { status: ExecutionStatus::Finished { exit_code }, stdout: Vec::new() })
            });
            Ok(ExecutionHandle { events: rx, result })
        }
    }

    fn cmd(name: &str, deps: &[&str]) -> Command {
        cmd_typed(name, TargetType::Test, deps)
    }

    fn cmd_typed(name: &str, target_type: TargetType, deps: &[&str]) -> Command {
        Command {
            name: name.to_owned(),
            target_type,
            script: vec!["true".to_owned()],
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            dependent_files: vec![],
            outputs: vec![],
            runtime: RuntimeRequirements::default(),
            working_dir: "/tmp".to_owned(),
            on_failure: None,
        }
    }

    #[tokio::test]
    async fn run_all_executes_every_command_and_reports_pass() {
        let graph = Graph::install(vec![cmd("a", &[]), cmd("b", &["a"])]).unwrap();
        let scheduler = Scheduler::new(
            graph,
            Arc::new(AlwaysPasses),
            EventBus::new(),
            "/tmp".to_owned(),
            SchedulerConfig { job_slots: 2, test_only: false },
        );
        let summary = scheduler.run_all(TraceId::new(), CancellationToken::new()).await.unwrap();
        assert_eq!(summary.statuses.get("a"), Some(&CStatus::Pass));
        assert_eq!(summary.statuses.get("b"), Some(&CStatus::Pass));
    }

    /// Concrete Scenario 4: `a` fails with an `on_failure` peer `a_rerun` that passes; `b`
    /// depends on `a` directly and must wait for `a_rerun`'s outcome, not `a`'s, before it is
    /// allowed to start.
    #[tokio::test]
    async fn a_failed_command_with_a_passing_on_failure_peer_unblocks_its_successors() {
        let mut a = cmd_typed("a", TargetType::Test, &[]);
        a.on_failure = Some("a_rerun".to_owned());
        let a_rerun = cmd_typed("a_rerun", TargetType::Rerun, &[]);
        let b = cmd_typed("b", TargetType::Test, &["a"]);

        let graph = Graph::install(vec![a, a_rerun, b]).unwrap();
        let bus = EventBus::new();
        let stream = bus.subscribe();

        let mut exit_codes = StdHashMap::new();
        exit_codes.insert("a".to_owned(), 1);
        exit_codes.insert("a_rerun".to_owned(), 0);
        exit_codes.insert("b".to_owned(), 0);

        let scheduler = Scheduler::new(
            graph,
            Arc::new(Scripted { exit_codes }),
            bus.clone(),
            "/tmp".to_owned(),
            SchedulerConfig { job_slots: 1, test_only: false },
        );
        let summary = scheduler.run_all(TraceId::new(), CancellationToken::new()).await.unwrap();
        bus.close();

        assert_eq!(summary.statuses.get("a"), Some(&CStatus::Fail));
        assert_eq!(summary.statuses.get("a_rerun"), Some(&CStatus::Pass));
        assert_eq!(summary.statuses.get("b"), Some(&CStatus::Pass));

        let mut order = Vec::new();
        while let Some(event) = stream.try_pop() {
            if let EventPayload::Command(c) = event.payload {
                match c.variant {
                    CommandEventVariant::Started => order.push(format!("Started({})", c.command_ref)),
                    CommandEventVariant::Finished { exit_code, .. } => {
                        order.push(format!("Finished({},{})", c.command_ref, exit_code))
                    }
                    _ => {}
                }
            }
        }

        assert_eq!(
            order,
            vec![
                "Started(a)".to_owned(),
                "Finished(a,1)".to_owned(),
                "Started(a_rerun)".to_owned(),
                "Finished(a_rerun,0)".to_owned(),
                "Started(b)".to_owned(),
                "Finished(b,0)".to_owned(),
            ]
        );
    }
}
