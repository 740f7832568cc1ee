//! Dry-run planning.
//!
//! Simulates a run without touching any collaborator: tiers are walked in
//! order, and inside a tier the scheduler's own eligibility rule is applied
//! wave by wave, assuming every dispatched task succeeds. Tasks that can
//! never become eligible are reported instead of looping forever.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

use serde::Serialize;

use crate::core::{ready_tasks, tiers, DependencyGraph, Task, TaskId};

/// Rough number of agent prompts one task costs end to end.
pub const PROMPTS_PER_TASK: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Wave {
    pub priority: u32,
    pub tasks: Vec<TaskId>,
}

/// Tasks that declare the same file and therefore never run together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictGroup {
    pub file: String,
    pub tasks: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanReport {
    pub total_tasks: usize,
    pub waves: Vec<Wave>,
    pub conflicts: Vec<ConflictGroup>,
    /// Tasks no wave could ever pick up.
    pub unschedulable: Vec<TaskId>,
    pub cycles: Vec<Vec<TaskId>>,
    pub estimated_prompts: usize,
}

impl PlanReport {
    pub fn is_schedulable(&self) -> bool {
        self.unschedulable.is_empty()
    }

    /// Human-readable plan.
    pub fn render(&self, tasks: &[Task], max_workers: usize) -> String {
        let by_id: BTreeMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
        let mut out = String::new();
        let _ = writeln!(out, "Dry run: execution plan");
        let _ = writeln!(out, "Tasks loaded: {}\n", self.total_tasks);

        for (i, wave) in self.waves.iter().enumerate() {
            let parallel = wave.tasks.len().min(max_workers.max(1));
            let _ = writeln!(
                out,
                "Wave {} [priority {}] ({} task(s), up to {} in parallel):",
                i + 1,
                wave.priority,
                wave.tasks.len(),
                parallel
            );
            for id in &wave.tasks {
                let Some(task) = by_id.get(id) else { continue };
                let mut line = format!("  - {}: {}", task.id, task.title);
                if !task.depends_on.is_empty() {
                    let deps: Vec<&str> = task.depends_on.iter().map(TaskId::as_str).collect();
                    let _ = write!(line, " [depends on: {}]", deps.join(", "));
                }
                if !task.files_touched.is_empty() {
                    let _ = write!(line, " [files: {}]", task.files_touched.join(", "));
                }
                let _ = writeln!(out, "{}", line);
            }
        }

        out.push('\n');
        if self.conflicts.is_empty() {
            let _ = writeln!(out, "No file conflicts detected.");
        } else {
            let _ = writeln!(out, "File conflict groups (run sequentially):");
            for group in &self.conflicts {
                let ids: Vec<&str> = group.tasks.iter().map(TaskId::as_str).collect();
                let _ = writeln!(out, "  {}: {}", group.file, ids.join(", "));
            }
        }

        if !self.unschedulable.is_empty() {
            let ids: Vec<&str> = self.unschedulable.iter().map(TaskId::as_str).collect();
            let _ = writeln!(
                out,
                "\nWarning: {} task(s) could not be scheduled (circular or missing dependency): {}",
                ids.len(),
                ids.join(", ")
            );
        }
        for cycle in &self.cycles {
            let ids: Vec<&str> = cycle.iter().map(TaskId::as_str).collect();
            let _ = writeln!(out, "Dependency cycle: {}", ids.join(" -> "));
        }

        let _ = writeln!(
            out,
            "\nEstimated prompt usage: {} tasks x ~{} prompts/task = ~{} prompts",
            self.total_tasks, PROMPTS_PER_TASK, self.estimated_prompts
        );
        let _ = writeln!(out, "Execution waves: {}", self.waves.len());
        out
    }
}

/// Files declared by more than one task, in path order.
pub fn conflict_groups(tasks: &[Task]) -> Vec<ConflictGroup> {
    let mut by_file: BTreeMap<&str, Vec<TaskId>> = BTreeMap::new();
    for task in tasks {
        for file in &task.files_touched {
            by_file.entry(file.as_str()).or_default().push(task.id.clone());
        }
    }
    by_file
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(file, tasks)| ConflictGroup {
            file: file.to_string(),
            tasks,
        })
        .collect()
}

/// Build the dry-run plan for `tasks`.
pub fn plan(tasks: &[Task]) -> PlanReport {
    let mut done: HashSet<TaskId> = HashSet::new();
    let mut waves = Vec::new();
    let mut unschedulable = Vec::new();
    let no_locks = HashSet::new();

    for priority in tiers(tasks) {
        loop {
            let eligible: Vec<&Task> = ready_tasks(tasks, &done, &no_locks)
                .into_iter()
                .filter(|t| t.priority == priority)
                .collect();
            if eligible.is_empty() {
                break;
            }

            // A task waits for a later wave if it shares a file with one
            // already picked.
            let mut picked: Vec<&Task> = Vec::new();
            for task in eligible {
                if !picked.iter().any(|p| p.conflicts_with(task)) {
                    picked.push(task);
                }
            }
            let ids: Vec<TaskId> = picked.iter().map(|t| t.id.clone()).collect();
            done.extend(ids.iter().cloned());
            waves.push(Wave {
                priority,
                tasks: ids,
            });
        }

        unschedulable.extend(
            tasks
                .iter()
                .filter(|t| t.priority == priority && !done.contains(&t.id))
                .map(|t| t.id.clone()),
        );
    }

    PlanReport {
        total_tasks: tasks.len(),
        waves,
        conflicts: conflict_groups(tasks),
        unschedulable,
        cycles: DependencyGraph::from_tasks(tasks).cycles(),
        estimated_prompts: tasks.len() * PROMPTS_PER_TASK,
    }
}
