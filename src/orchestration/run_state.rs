//! Mutable state of one scheduling run.
//!
//! Only the scheduler's control loop touches a `RunState`. Jobs running in
//! the worker pool report back exclusively through their join handles.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::{tiers, Artifact, ExecutionResult, RemediationOutcome, Task, TaskId};
use crate::orchestration::event::HaltReason;
use crate::orchestration::status::{
    ArtifactRef, RunSnapshot, Summary, TaskCounts, TaskTiming, WorkerState, WorkerStatus,
};
use crate::Result;

pub type ExecutionJob = JoinHandle<Result<(ExecutionResult, Task)>>;
pub type PipelineJob = JoinHandle<Result<RemediationOutcome>>;

/// An attempt in flight. Its files stay locked until it leaves the map.
pub struct Execution {
    pub handle: ExecutionJob,
    pub files: Vec<String>,
    pub branch: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default)]
struct Metrics {
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    cost_usd: Option<f64>,
    num_turns: Option<u32>,
}

impl Metrics {
    fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or(now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

pub struct RunState {
    run_id: Uuid,
    tasks: Vec<Task>,
    tiers: Vec<u32>,
    tier_index: usize,
    completed: HashSet<TaskId>,
    failed: HashMap<TaskId, String>,
    executing: HashMap<TaskId, Execution>,
    pipelines: HashMap<TaskId, PipelineJob>,
    locked: HashSet<String>,
    retries: HashMap<TaskId, u32>,
    metrics: HashMap<TaskId, Metrics>,
    artifacts: Vec<(TaskId, Artifact)>,
}

impl RunState {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            tiers: tiers(&tasks),
            tier_index: 0,
            tasks,
            completed: HashSet::new(),
            failed: HashMap::new(),
            executing: HashMap::new(),
            pipelines: HashMap::new(),
            locked: HashSet::new(),
            retries: HashMap::new(),
            metrics: HashMap::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    /// Swap in a task whose description was augmented before dispatch.
    pub fn replace_task(&mut self, task: Task) {
        if let Some(slot) = self.tasks.iter_mut().find(|t| t.id == task.id) {
            *slot = task;
        }
    }

    pub fn completed(&self) -> &HashSet<TaskId> {
        &self.completed
    }

    pub fn failed(&self) -> &HashMap<TaskId, String> {
        &self.failed
    }

    pub fn locked(&self) -> &HashSet<String> {
        &self.locked
    }

    pub fn is_settled(&self, id: &TaskId) -> bool {
        self.completed.contains(id) || self.failed.contains_key(id)
    }

    pub fn is_in_flight(&self, id: &TaskId) -> bool {
        self.executing.contains_key(id) || self.pipelines.contains_key(id)
    }

    pub fn all_settled(&self) -> bool {
        self.tasks.iter().all(|t| self.is_settled(&t.id))
    }

    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    pub fn unsettled(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| !self.is_settled(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }

    // ========== Tiers ==========

    pub fn current_priority(&self) -> Option<u32> {
        self.tiers.get(self.tier_index).copied()
    }

    pub fn tier_settled(&self, priority: u32) -> bool {
        self.tasks
            .iter()
            .filter(|t| t.priority == priority)
            .all(|t| self.is_settled(&t.id))
    }

    /// Move the tier pointer forward. Returns the new priority, if any.
    pub fn advance_tier(&mut self) -> Option<u32> {
        self.tier_index += 1;
        self.current_priority()
    }

    // ========== Executions ==========

    /// Record a dispatched attempt and lock its files.
    pub fn start_execution(&mut self, id: TaskId, execution: Execution) {
        self.locked.extend(execution.files.iter().cloned());
        let metrics = self.metrics.entry(id.clone()).or_default();
        metrics.started_at.get_or_insert_with(Utc::now);
        metrics.finished_at = None;
        self.executing.insert(id, execution);
    }

    pub fn finished_executions(&self) -> Vec<TaskId> {
        self.executing
            .iter()
            .filter(|(_, e)| e.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Remove an attempt and release its files.
    pub fn take_execution(&mut self, id: &TaskId) -> Option<Execution> {
        let execution = self.executing.remove(id)?;
        for file in &execution.files {
            self.locked.remove(file);
        }
        Some(execution)
    }

    /// Fold an attempt's cost and turn counts into the task's totals.
    pub fn record_result(&mut self, result: &ExecutionResult) {
        let metrics = self.metrics.entry(result.task_id.clone()).or_default();
        if let Some(cost) = result.cost_usd {
            *metrics.cost_usd.get_or_insert(0.0) += cost;
        }
        if let Some(turns) = result.num_turns {
            *metrics.num_turns.get_or_insert(0) += turns;
        }
    }

    pub fn retries(&self, id: &TaskId) -> u32 {
        self.retries.get(id).copied().unwrap_or(0)
    }

    pub fn bump_retries(&mut self, id: &TaskId) -> u32 {
        let count = self.retries.entry(id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    // ========== Pipelines ==========

    pub fn start_pipeline(&mut self, id: TaskId, artifact: Artifact, handle: PipelineJob) {
        self.artifacts.push((id.clone(), artifact));
        self.pipelines.insert(id, handle);
    }

    pub fn finished_pipelines(&self) -> Vec<TaskId> {
        self.pipelines
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn take_pipeline(&mut self, id: &TaskId) -> Option<PipelineJob> {
        self.pipelines.remove(id)
    }

    pub fn artifact(&self, id: &TaskId) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .rev()
            .find(|(tid, _)| tid == id)
            .map(|(_, a)| a)
    }

    pub fn artifacts(&self) -> &[(TaskId, Artifact)] {
        &self.artifacts
    }

    // ========== Settling ==========

    pub fn mark_completed(&mut self, id: &TaskId) {
        if self.failed.contains_key(id) {
            return;
        }
        self.finish_metrics(id);
        self.completed.insert(id.clone());
    }

    pub fn mark_failed(&mut self, id: &TaskId, error: impl Into<String>) {
        if self.completed.contains(id) {
            return;
        }
        self.finish_metrics(id);
        self.failed.entry(id.clone()).or_insert_with(|| error.into());
    }

    fn finish_metrics(&mut self, id: &TaskId) {
        if let Some(metrics) = self.metrics.get_mut(id) {
            metrics.finished_at.get_or_insert_with(Utc::now);
        }
    }

    /// Remove every in-flight attempt and release all file locks.
    pub fn drain_executions(&mut self) -> Vec<(TaskId, Execution)> {
        self.locked.clear();
        self.executing.drain().collect()
    }

    pub fn drain_pipelines(&mut self) -> Vec<(TaskId, PipelineJob)> {
        self.pipelines.drain().collect()
    }

    // ========== Snapshot ==========

    pub fn snapshot(&self, halt: Option<HaltReason>) -> RunSnapshot {
        let now = Utc::now();
        let settled = self.completed.len() + self.failed.len();
        let in_flight = self.executing.len() + self.pipelines.len();

        let mut workers = BTreeMap::new();
        let running = self.executing.keys().map(|id| (id, WorkerState::Running));
        let reviewing = self.pipelines.keys().map(|id| (id, WorkerState::Reviewing));
        for (id, status) in running.chain(reviewing) {
            workers.insert(
                id.to_string(),
                WorkerStatus {
                    status,
                    retries: self.retries(id),
                    elapsed_seconds: self.metrics.get(id).and_then(|m| m.elapsed_seconds(now)),
                },
            );
        }

        let task_timing = self
            .metrics
            .iter()
            .filter(|(id, _)| self.is_settled(id))
            .map(|(id, m)| {
                (
                    id.to_string(),
                    TaskTiming {
                        elapsed_seconds: m.elapsed_seconds(now),
                        cost_usd: m.cost_usd,
                        num_turns: m.num_turns,
                    },
                )
            })
            .collect();

        let summary = Summary {
            total_elapsed_seconds: self
                .metrics
                .values()
                .filter_map(|m| m.elapsed_seconds(now))
                .sum(),
            total_cost_usd: self.metrics.values().filter_map(|m| m.cost_usd).sum(),
            total_prompts: self
                .metrics
                .values()
                .filter_map(|m| m.num_turns)
                .map(u64::from)
                .sum(),
        };

        RunSnapshot {
            run_id: self.run_id,
            updated_at: now,
            tasks: TaskCounts {
                total: self.tasks.len(),
                queued: self.tasks.len().saturating_sub(settled + in_flight),
                active: self.executing.len(),
                reviewing: self.pipelines.len(),
                completed: self.completed.len(),
                failed: self.failed.len(),
            },
            workers,
            task_timing,
            summary,
            current_priority: self.current_priority(),
            retries: self
                .retries
                .iter()
                .map(|(id, n)| (id.to_string(), *n))
                .collect(),
            prs: self
                .artifacts
                .iter()
                .map(|(id, a)| ArtifactRef {
                    task_id: id.to_string(),
                    pr_url: a.url.clone(),
                    pr_number: a.number,
                })
                .collect(),
            halt,
        }
    }
}
