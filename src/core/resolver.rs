//! Dependency and isolation resolution.
//!
//! [`ready_tasks`] is the single eligibility rule shared by the scheduler and
//! the dry-run planner. [`DependencyGraph`] answers structural questions
//! (cycles, ordering) that eligibility alone cannot explain.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use super::task::{Task, TaskId};
use crate::{Error, Result};

/// Tasks that may start now, ordered by ascending priority.
///
/// A task is eligible when it is not completed, all of its dependencies are
/// completed, and none of its declared files are locked. Ties keep input
/// order.
pub fn ready_tasks<'a>(
    tasks: &'a [Task],
    completed: &HashSet<TaskId>,
    locked: &HashSet<String>,
) -> Vec<&'a Task> {
    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|t| !completed.contains(&t.id))
        .filter(|t| t.depends_on.iter().all(|d| completed.contains(d)))
        .filter(|t| !t.files_touched.iter().any(|f| locked.contains(f)))
        .collect();
    ready.sort_by_key(|t| t.priority);
    ready
}

/// Distinct priorities present in `tasks`, ascending.
pub fn tiers(tasks: &[Task]) -> Vec<u32> {
    tasks
        .iter()
        .map(|t| t.priority)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Dependency graph over a task batch. Edges point from a dependency to the
/// task that needs it.
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph. Dependencies on unknown ids are ignored here; plan
    /// loading rejects them.
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for task in tasks {
            let node = graph.add_node(task.id.clone());
            index.insert(task.id.clone(), node);
        }
        for task in tasks {
            let to = index[&task.id];
            for dep in &task.depends_on {
                if let Some(&from) = index.get(dep) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        Self { graph, index }
    }

    /// Every dependency cycle, each as a sorted list of ids.
    pub fn cycles(&self) -> Vec<Vec<TaskId>> {
        let mut cycles: Vec<Vec<TaskId>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0])
            })
            .map(|scc| {
                let mut ids: Vec<TaskId> = scc.iter().map(|n| self.graph[*n].clone()).collect();
                ids.sort();
                ids
            })
            .collect();
        cycles.sort();
        cycles
    }

    /// Ids in an order where every dependency precedes its dependents.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Plan`] naming a task on a cycle.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|n| self.graph[n].clone()).collect())
            .map_err(|cycle| {
                Error::Plan(format!(
                    "Dependency cycle involving '{}'",
                    self.graph[cycle.node_id()]
                ))
            })
    }

    /// Ids that transitively depend on `id`.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for next in self.graph.neighbors(node) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        let mut ids: Vec<TaskId> = seen.into_iter().map(|n| self.graph[n].clone()).collect();
        ids.sort();
        ids
    }
}
