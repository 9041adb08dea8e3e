//! The validated dependency DAG. Nodes are addressed by arena index ([`CommandIdx`]) rather than
//! owning pointers, so a [`Graph`] is cheap to clone for post-mortem analysis (e.g. handing a
//! snapshot to the invocation recorder after the run has moved on).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use smelt_types::{ClientError, Command, CommandRef, TargetType};

/// An arena index into a [`Graph`]'s command list. Stable for the lifetime of that graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandIdx(usize);

impl CommandIdx {
    pub fn index(self) -> usize {
        self.0
    }
}

struct GraphInner {
    commands: Vec<Command>,
    name_to_idx: HashMap<CommandRef, CommandIdx>,
    /// Forward edges: `dependencies[i]` are the commands `i` depends on.
    dependencies: Vec<Vec<CommandIdx>>,
    /// Back edges: `successors[i]` are the commands that depend on `i`.
    successors: Vec<Vec<CommandIdx>>,
    on_failure: HashMap<CommandIdx, CommandIdx>,
}

/// The pair (commands, edges) currently installed. Cloning a `Graph` is an `Arc` bump.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Graph {
    /// Validates `commands` and builds a new graph. On any validation failure, the caller's
    /// previous graph (if any) is untouched -- this function never mutates existing state.
    pub fn install(commands: Vec<Command>) -> Result<Graph, ClientError> {
        let mut name_to_idx = HashMap::with_capacity(commands.len());
        for (i, cmd) in commands.iter().enumerate() {
            if name_to_idx.insert(cmd.name.clone(), CommandIdx(i)).is_some() {
                return Err(ClientError::DuplicateName(cmd.name.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); commands.len()];
        let mut successors = vec![Vec::new(); commands.len()];
        for (i, cmd) in commands.iter().enumerate() {
            for dep in &cmd.dependencies {
                let dep_idx = *name_to_idx
                    .get(dep)
                    .ok_or_else(|| ClientError::UnknownDependency {
                        command: cmd.name.clone(),
                        dependency: dep.clone(),
                    })?;
                dependencies[i].push(dep_idx);
                successors[dep_idx.index()].push(CommandIdx(i));
            }
        }

        let mut on_failure = HashMap::new();
        for (i, cmd) in commands.iter().enumerate() {
            if let Some(target) = &cmd.on_failure {
                let target_idx =
                    *name_to_idx
                        .get(target)
                        .ok_or_else(|| ClientError::UnknownOnFailure {
                            command: cmd.name.clone(),
                            target: target.clone(),
                        })?;
                on_failure.insert(CommandIdx(i), target_idx);
            }
        }

        let mut seen_outputs: HashMap<&str, &str> = HashMap::new();
        for cmd in &commands {
            for output in &cmd.outputs {
                if let Some(first) = seen_outputs.insert(output.as_str(), cmd.name.as_str()) {
                    if first != cmd.name {
                        return Err(ClientError::DuplicateOutput {
                            path: output.clone(),
                            first: first.to_owned(),
                            second: cmd.name.clone(),
                        });
                    }
                }
            }
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            let names: Vec<&str> = cycle
                .iter()
                .map(|idx| commands[idx.index()].name.as_str())
                .collect();
            return Err(ClientError::CycleDetected(names.join(" -> ")));
        }

        Ok(Graph {
            inner: Arc::new(GraphInner {
                commands,
                name_to_idx,
                dependencies,
                successors,
                on_failure,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.commands.is_empty()
    }

    pub fn command(&self, idx: CommandIdx) -> &Command {
        &self.inner.commands[idx.index()]
    }

    pub fn idx_of(&self, name: &str) -> Option<CommandIdx> {
        self.inner.name_to_idx.get(name).copied()
    }

    pub fn all_indices(&self) -> impl Iterator<Item = CommandIdx> + '_ {
        (0..self.inner.commands.len()).map(CommandIdx)
    }

    pub fn dependencies(&self, idx: CommandIdx) -> &[CommandIdx] {
        &self.inner.dependencies[idx.index()]
    }

    pub fn successors(&self, idx: CommandIdx) -> &[CommandIdx] {
        &self.inner.successors[idx.index()]
    }

    pub fn predecessors(&self, idx: CommandIdx) -> &[CommandIdx] {
        self.dependencies(idx)
    }

    pub fn on_failure(&self, idx: CommandIdx) -> Option<CommandIdx> {
        self.inner.on_failure.get(&idx).copied()
    }

    /// Every command with all dependencies present in `done`, excluding anything in `exclude`
    /// (typically whatever the scheduler has already scheduled, started, or finished).
    pub fn ready(&self, done: &HashSet<CommandIdx>, exclude: &HashSet<CommandIdx>) -> Vec<CommandIdx> {
        self.all_indices()
            .filter(|idx| !exclude.contains(idx))
            .filter(|idx| self.dependencies(*idx).iter().all(|d| done.contains(d)))
            .collect()
    }

    /// All ancestors of `idx` (transitive dependencies), not including `idx` itself.
    pub fn ancestors(&self, idx: CommandIdx) -> HashSet<CommandIdx> {
        let mut out = HashSet::new();
        let mut stack = vec![idx];
        while let Some(cur) = stack.pop() {
            for dep in self.dependencies(cur) {
                if out.insert(*dep) {
                    stack.push(*dep);
                }
            }
        }
        out
    }

    /// All transitive successors of `idx` (commands that transitively depend on it), used by the
    /// skip-propagation policy in the scheduler.
    pub fn transitive_successors(&self, idx: CommandIdx) -> HashSet<CommandIdx> {
        let mut out = HashSet::new();
        let mut stack = vec![idx];
        while let Some(cur) = stack.pop() {
            for succ in self.successors(cur) {
                if out.insert(*succ) {
                    stack.push(*succ);
                }
            }
        }
        out
    }

    /// The frontier for `run_type`: ancestors of every command of `kind`, union the commands of
    /// `kind` themselves. Rebuild/rerun commands are never included directly.
    pub fn frontier_for_type(&self, kind: TargetType) -> HashSet<CommandIdx> {
        let mut frontier = HashSet::new();
        for idx in self.all_indices() {
            if self.command(idx).target_type == kind && !kind.is_rerun_variant() {
                frontier.insert(idx);
                frontier.extend(self.ancestors(idx));
            }
        }
        frontier
    }

    /// The frontier for `run_all`: every command that is not a rebuild/rerun variant.
    pub fn frontier_all(&self) -> HashSet<CommandIdx> {
        self.all_indices()
            .filter(|idx| !self.command(*idx).target_type.is_rerun_variant())
            .collect()
    }
}

fn find_cycle(dependencies: &[Vec<CommandIdx>]) -> Option<Vec<CommandIdx>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let n = dependencies.len();
    let mut marks = vec![Mark::Unvisited; n];
    let mut path = Vec::new();

    fn visit(
        node: usize,
        dependencies: &[Vec<CommandIdx>],
        marks: &mut [Mark],
        path: &mut Vec<CommandIdx>,
    ) -> Option<Vec<CommandIdx>> {
        match marks[node] {
            Mark::Done => return None,
            Mark::InProgress => {
                let start = path.iter().position(|i| i.index() == node).unwrap();
                let mut cycle = path[start..].to_vec();
                cycle.push(CommandIdx(node));
                return Some(cycle);
            }
            Mark::Unvisited => {}
        }

        marks[node] = Mark::InProgress;
        path.push(CommandIdx(node));
        for dep in &dependencies[node] {
            if let Some(cycle) = visit(dep.index(), dependencies, marks, path) {
                return Some(cycle);
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }

    for start in 0..n {
        if marks[start] == Mark::Unvisited {
            if let Some(cycle) = visit(start, dependencies, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}
