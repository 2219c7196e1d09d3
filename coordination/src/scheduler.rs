//! Dependency Graph & Scheduler: cycle validation, topological
//! ordering, parallel-stage partitioning, critical-path length, and the
//! poll-driven "what can run right now" query the Orchestrator uses while
//! `Status::Orchestrating`.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graphmap::DiGraphMap;

use crate::state::types::{SubtaskDefinition, SubtaskId};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("dependency graph has a cycle")]
    Cycle,
    #[error("subtask {0} depends on unknown subtask {1}")]
    UnknownDependency(SubtaskId, SubtaskId),
    #[error("parallel-group partitioning stalled: {remaining} subtasks remain but none are ready")]
    Stalled { remaining: usize },
}

/// The dependency graph over a set of subtask definitions, built once per
/// Breakdown result and reused for every scheduling query against it.
pub struct SubtaskGraph<'a> {
    defs: HashMap<&'a str, &'a SubtaskDefinition>,
    graph: DiGraphMap<&'a str, ()>,
    order: Vec<&'a str>,
}

impl<'a> SubtaskGraph<'a> {
    /// Builds the graph, validating every dependency reference resolves and
    /// the graph is acyclic.
    pub fn build(defs: &'a [SubtaskDefinition]) -> Result<Self, SchedulerError> {
        let by_id: HashMap<&str, &SubtaskDefinition> =
            defs.iter().map(|d| (d.id.as_str(), d)).collect();

        let mut graph = DiGraphMap::new();
        let order: Vec<&str> = defs.iter().map(|d| d.id.as_str()).collect();
        for id in &order {
            graph.add_node(*id);
        }
        for def in defs {
            for dep in &def.dependencies {
                if !by_id.contains_key(dep.as_str()) {
                    return Err(SchedulerError::UnknownDependency(
                        def.id.clone(),
                        dep.clone(),
                    ));
                }
                // Edge dependency -> dependent, so dependents come after.
                graph.add_edge(dep.as_str(), def.id.as_str(), ());
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(SchedulerError::Cycle);
        }

        Ok(Self {
            defs: by_id,
            graph,
            order,
        })
    }

    pub fn definition(&self, id: &str) -> Option<&SubtaskDefinition> {
        self.defs.get(id).copied()
    }

    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.graph.neighbors(id).collect()
    }

    /// Memoized DFS depth from any root (longest incoming chain length).
    pub fn depth_of(&self, id: &str, memo: &mut HashMap<String, usize>) -> usize {
        if let Some(d) = memo.get(id) {
            return *d;
        }
        let def = match self.defs.get(id) {
            Some(d) => d,
            None => return 0,
        };
        let depth = def
            .dependencies
            .iter()
            .map(|dep| self.depth_of(dep, memo) + 1)
            .max()
            .unwrap_or(0);
        memo.insert(id.to_string(), depth);
        depth
    }
}

/// Validates the dependency graph has no cycles, independent of building a
/// full [`SubtaskGraph`] — used as a standalone Breakdown-output check.
pub fn validate_no_cycles(defs: &[SubtaskDefinition]) -> Result<(), SchedulerError> {
    SubtaskGraph::build(defs).map(|_| ())
}

/// Kahn's algorithm with a stable insertion-order tie-break: `petgraph`'s
/// `toposort` doesn't guarantee one, so ties are broken by resolving ready
/// nodes in the order they appear in `defs`.
pub fn topological_sort(defs: &[SubtaskDefinition]) -> Result<Vec<SubtaskId>, SchedulerError> {
    let graph = SubtaskGraph::build(defs)?;
    // Confirm acyclicity via petgraph's own algorithm as well, since it's
    // the grounding dependency for this module.
    if toposort(&graph.graph, None).is_err() {
        return Err(SchedulerError::Cycle);
    }

    let mut in_degree: HashMap<&str, usize> = defs
        .iter()
        .map(|d| (d.id.as_str(), d.dependencies.len()))
        .collect();
    let mut out = Vec::with_capacity(defs.len());
    let mut remaining: HashSet<&str> = defs.iter().map(|d| d.id.as_str()).collect();

    while !remaining.is_empty() {
        let ready: Vec<&str> = graph
            .order
            .iter()
            .copied()
            .filter(|id| remaining.contains(id) && in_degree[id] == 0)
            .collect();
        if ready.is_empty() {
            return Err(SchedulerError::Cycle);
        }
        for id in ready {
            out.push(id.to_string());
            remaining.remove(id);
            for dependent in graph.dependents_of(id) {
                if let Some(d) = in_degree.get_mut(dependent) {
                    *d = d.saturating_sub(1);
                }
            }
        }
    }
    Ok(out)
}

/// Repeatedly collects every subtask whose dependencies are all already
/// grouped, yielding successive parallel-execution stages.
pub fn find_parallel_groups(
    defs: &[SubtaskDefinition],
) -> Result<Vec<Vec<SubtaskId>>, SchedulerError> {
    let graph = SubtaskGraph::build(defs)?;
    let mut done: HashSet<&str> = HashSet::new();
    let mut groups = Vec::new();

    while done.len() < defs.len() {
        let stage: Vec<&str> = graph
            .order
            .iter()
            .copied()
            .filter(|id| !done.contains(id))
            .filter(|id| {
                graph
                    .definition(id)
                    .map(|d| d.dependencies.iter().all(|dep| done.contains(dep.as_str())))
                    .unwrap_or(false)
            })
            .collect();
        if stage.is_empty() {
            return Err(SchedulerError::Stalled {
                remaining: defs.len() - done.len(),
            });
        }
        for id in &stage {
            done.insert(id);
        }
        groups.push(stage.into_iter().map(str::to_string).collect());
    }
    Ok(groups)
}

/// The longest dependency chain length, traced from every leaf (a subtask
/// with no dependents).
pub fn critical_path(defs: &[SubtaskDefinition]) -> Result<usize, SchedulerError> {
    let graph = SubtaskGraph::build(defs)?;
    let mut memo = HashMap::new();
    let mut longest = 0;
    for def in defs {
        if graph.dependents_of(&def.id).is_empty() {
            longest = longest.max(graph.depth_of(&def.id, &mut memo) + 1);
        }
    }
    Ok(longest)
}

/// Subtasks whose dependencies are all completed, that are not already
/// completed or in progress, up to `max_parallel`, in insertion order.
pub fn get_next_executable_subtasks(
    defs: &[SubtaskDefinition],
    completed: &HashSet<SubtaskId>,
    in_progress: &HashSet<SubtaskId>,
    max_parallel: usize,
) -> Vec<SubtaskId> {
    defs.iter()
        .filter(|d| !completed.contains(&d.id) && !in_progress.contains(&d.id))
        .filter(|d| d.dependencies.iter().all(|dep| completed.contains(dep)))
        .take(max_parallel)
        .map(|d| d.id.clone())
        .collect()
}
