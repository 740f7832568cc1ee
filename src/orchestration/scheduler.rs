//! Tiered scheduler for parallel task execution.
//!
//! The `Scheduler` drives a whole run. Tasks are grouped into priority tiers
//! and a tier only starts once the previous one has settled. Within a tier,
//! eligible tasks are dispatched to workers up to the concurrency limit,
//! with their declared files locked from dispatch until the attempt ends.
//! Produced change requests flow into the remediation pipeline, which does
//! not occupy an execution slot.
//!
//! The control loop never awaits a single job: each tick it polls join
//! handles for completion, processes whatever finished, dispatches, writes
//! the run snapshot and then sleeps for the poll interval.
//!
//! On cancellation the pool stops admitting work and in-flight jobs are
//! drained: workers abandon their attempt but still release the worktree
//! and write their log, pipelines stop at the next stage boundary. Jobs
//! still running when the drain deadline passes are aborted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::plan::validate;
use crate::core::{
    ready_tasks, Artifact, DependencyGraph, ExecutionOutcome, RemediationOutcome, Task, TaskId,
};
use crate::orchestration::event::{EventSink, HaltReason, SchedulerEvent};
use crate::orchestration::pipeline::{Pipeline, PipelineSettings};
use crate::orchestration::pool::WorkerPool;
use crate::orchestration::run_state::{Execution, RunState};
use crate::orchestration::status::RunSnapshot;
use crate::orchestration::worker::{branch_name, Worker, WorkerSettings};
use crate::ports::Collaborators;
use crate::{flog, flog_debug, flog_error, flog_warn, Result};

/// Scheduling knobs.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Maximum simultaneous execution attempts.
    pub max_workers: usize,
    /// Retries per task after its first failed attempt.
    pub max_retries: u32,
    /// Stop once this tier has settled.
    pub max_priority: Option<u32>,
    pub poll_interval: Duration,
    /// Where to write the run snapshot, if anywhere.
    pub status_path: Option<PathBuf>,
    /// Capacity shared by executions and pipelines.
    pub pool_size: usize,
    /// How long a cancelled run waits for in-flight jobs to wind down.
    pub drain_timeout: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_workers: config.max_workers,
            max_retries: config.max_retries,
            max_priority: config.max_priority,
            poll_interval: config.poll_interval(),
            status_path: Some(config.status_file()),
            pool_size: config.max_workers * 2,
            drain_timeout: config.drain_timeout(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Final account of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub completed: Vec<TaskId>,
    /// Failed tasks with their last error.
    pub failed: Vec<(TaskId, String)>,
    /// Tasks left untouched by a halt before every task settled. After a
    /// [`HaltReason::MaxPriorityReached`] halt these are skipped on purpose.
    pub unsettled: Vec<TaskId>,
    pub halt: HaltReason,
    pub artifacts: Vec<(TaskId, Artifact)>,
    pub snapshot: RunSnapshot,
}

impl RunReport {
    /// No failures, and nothing left behind except tiers above the
    /// requested maximum priority.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
            && (self.unsettled.is_empty() || self.halt == HaltReason::MaxPriorityReached)
    }
}

pub struct Scheduler {
    state: RunState,
    graph: DependencyGraph,
    collaborators: Collaborators,
    settings: SchedulerSettings,
    worker_settings: Arc<WorkerSettings>,
    pipeline_settings: Arc<PipelineSettings>,
    pool: WorkerPool,
    events: EventSink,
    cancel: CancellationToken,
    /// Work-item bookkeeping and branch cleanup that must finish before the
    /// run returns.
    side_jobs: JoinSet<()>,
}

impl Scheduler {
    /// Create a scheduler for `tasks`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Plan`] if ids are duplicated or a dependency
    /// names an unknown task.
    pub fn new(
        tasks: Vec<Task>,
        collaborators: Collaborators,
        settings: SchedulerSettings,
        worker_settings: WorkerSettings,
        pipeline_settings: PipelineSettings,
    ) -> Result<Self> {
        validate(&tasks)?;
        Ok(Self {
            graph: DependencyGraph::from_tasks(&tasks),
            state: RunState::new(tasks),
            collaborators,
            pool: WorkerPool::new(settings.pool_size.max(settings.max_workers)),
            settings,
            worker_settings: Arc::new(worker_settings),
            pipeline_settings: Arc::new(pipeline_settings),
            events: EventSink::none(),
            cancel: CancellationToken::new(),
            side_jobs: JoinSet::new(),
        })
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Run until every task settles, the run deadlocks, the priority limit
    /// is reached, or cancellation is requested.
    pub async fn run(mut self) -> Result<RunReport> {
        flog!(
            "Scheduling {} task(s) across tiers starting at {:?} (max_workers={}, max_retries={})",
            self.state.tasks().len(),
            self.state.current_priority(),
            self.settings.max_workers,
            self.settings.max_retries
        );
        if let Some(priority) = self.state.current_priority() {
            self.events.emit(SchedulerEvent::TierStarted { priority });
        }

        let halt = loop {
            if self.cancel.is_cancelled() {
                break HaltReason::Cancelled;
            }
            if let Some(halt) = self.tick().await {
                break halt;
            }
            self.write_status(None);
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        };

        self.finish(halt).await
    }

    /// One pass of the control loop. Returns a halt reason when the run
    /// should stop.
    pub async fn tick(&mut self) -> Option<HaltReason> {
        while let Some(done) = self.side_jobs.try_join_next() {
            if let Err(e) = done {
                flog_warn!("Background bookkeeping job crashed: {}", e);
            }
        }
        self.collect_executions().await;
        self.collect_pipelines().await;

        if self.state.all_settled() {
            return Some(HaltReason::AllSettled);
        }
        if let Some(halt) = self.advance_tiers() {
            return Some(halt);
        }

        self.dispatch();

        if self.state.executing_count() == 0 && self.state.pipeline_count() == 0 {
            let stuck = self.state.unsettled();
            flog_error!(
                "No task can make progress; {} unsettled: {:?}",
                stuck.len(),
                stuck
            );
            return Some(HaltReason::Deadlock);
        }
        None
    }

    /// Advance past every settled tier. Returns a halt when the next tier
    /// lies beyond the configured maximum priority.
    fn advance_tiers(&mut self) -> Option<HaltReason> {
        while let Some(priority) = self.state.current_priority() {
            if self.settings.max_priority.is_some_and(|max| priority > max) {
                flog!(
                    "Tier {} is beyond max priority {:?}; stopping",
                    priority,
                    self.settings.max_priority
                );
                return Some(HaltReason::MaxPriorityReached);
            }
            if !self.state.tier_settled(priority) {
                return None;
            }
            flog!("Tier {} settled", priority);
            if let Some(next) = self.state.advance_tier() {
                flog!("Starting tier {}", next);
                self.events.emit(SchedulerEvent::TierStarted { priority: next });
            }
        }
        None
    }

    fn dispatch(&mut self) -> usize {
        let Some(priority) = self.state.current_priority() else {
            return 0;
        };
        let budget = self
            .settings
            .max_workers
            .saturating_sub(self.state.executing_count());
        if budget == 0 {
            return 0;
        }

        let candidates: Vec<Task> = ready_tasks(
            self.state.tasks(),
            self.state.completed(),
            self.state.locked(),
        )
        .into_iter()
        .filter(|t| t.priority == priority)
        .filter(|t| !self.state.is_settled(&t.id) && !self.state.is_in_flight(&t.id))
        .cloned()
        .collect();

        let mut dispatched = 0;
        for task in candidates {
            if dispatched == budget {
                break;
            }
            // Locks taken earlier in this pass are not in the candidate list.
            if task.files_touched.iter().any(|f| self.state.locked().contains(f)) {
                flog_debug!("Task {} deferred: files locked this tick", task.id);
                continue;
            }
            if self.launch(task) {
                dispatched += 1;
            }
        }
        dispatched
    }

    fn launch(&mut self, task: Task) -> bool {
        let attempt = self.state.retries(&task.id);
        let branch = branch_name(&task, attempt);
        let collaborators = self.collaborators.clone();
        let settings = self.worker_settings.clone();
        let cancel = self.cancel.clone();
        let enricher = if attempt == 0 {
            self.collaborators.enricher.clone()
        } else {
            None
        };

        let job_task = task.clone();
        let job = async move {
            let task = match enricher {
                Some(enricher) => match enricher.enrich(&job_task).await {
                    Ok(Some(context)) => job_task.with_context(&context),
                    Ok(None) => job_task,
                    Err(e) => {
                        flog_warn!("Enrichment of {} failed, using original: {}", job_task.id, e);
                        job_task
                    }
                },
                None => job_task,
            };
            let worker = Worker::new(task.clone(), attempt, &collaborators, settings)
                .with_cancellation(cancel);
            (worker.run().await, task)
        };

        match self.pool.spawn(job) {
            Ok(handle) => {
                flog!("Dispatched {} (attempt {}) on {}", task.id, attempt + 1, branch);
                self.events.emit(SchedulerEvent::TaskStarted {
                    task_id: task.id.clone(),
                    branch: branch.clone(),
                    attempt,
                });
                self.state.start_execution(
                    task.id.clone(),
                    Execution {
                        handle,
                        files: task.files_touched.clone(),
                        branch,
                        attempt,
                    },
                );
                true
            }
            Err(e) => {
                flog_error!("Could not dispatch {}: {}", task.id, e);
                self.fail(&task.id, e.to_string());
                false
            }
        }
    }

    async fn collect_executions(&mut self) {
        for id in self.state.finished_executions() {
            let Some(execution) = self.state.take_execution(&id) else {
                continue;
            };
            match execution.handle.await {
                Ok(Ok((result, task))) => {
                    self.state.replace_task(task);
                    self.state.record_result(&result);
                    match result.outcome {
                        ExecutionOutcome::Succeeded {
                            artifact: Some(artifact),
                        } => self.start_pipeline(&id, artifact),
                        ExecutionOutcome::Succeeded { artifact: None } => self.complete(&id),
                        ExecutionOutcome::Failed { error } => {
                            self.retry_or_fail(&id, &execution.branch, error)
                        }
                    }
                }
                Ok(Err(e)) => self.retry_or_fail(&id, &execution.branch, e.to_string()),
                Err(join_error) => self.retry_or_fail(
                    &id,
                    &execution.branch,
                    format!("Worker crashed: {}", join_error),
                ),
            }
        }
    }

    fn retry_or_fail(&mut self, id: &TaskId, branch: &str, error: String) {
        let used = self.state.retries(id);
        if used >= self.settings.max_retries || self.cancel.is_cancelled() {
            flog_error!("Task {} failed after {} attempt(s): {}", id, used + 1, error);
            self.fail(id, error);
            return;
        }

        let attempt = self.state.bump_retries(id);
        flog_warn!(
            "Task {} failed, retrying ({}/{}): {}",
            id,
            attempt,
            self.settings.max_retries,
            error
        );
        self.events.emit(SchedulerEvent::TaskRetrying {
            task_id: id.clone(),
            attempt,
            error,
        });

        let vcs = self.collaborators.vcs.clone();
        let branch = branch.to_string();
        self.side_jobs.spawn(async move {
            if let Err(e) = vcs.delete_branch(&branch).await {
                flog_debug!("Cleanup of {} failed: {}", branch, e);
            }
        });
        // The task is eligible again and is redispatched with the next
        // attempt number.
    }

    fn start_pipeline(&mut self, id: &TaskId, artifact: Artifact) {
        flog!("Task {} produced {}; starting review", id, artifact.url);
        self.events.emit(SchedulerEvent::ArtifactProduced {
            task_id: id.clone(),
            url: artifact.url.clone(),
        });
        let pipeline = Pipeline::new(
            id.clone(),
            artifact.clone(),
            &self.collaborators,
            self.pipeline_settings.clone(),
            self.events.clone(),
        )
        .with_cancellation(self.cancel.clone());
        match self.pool.spawn(pipeline.run()) {
            Ok(handle) => self.state.start_pipeline(id.clone(), artifact, handle),
            Err(e) => self.fail(id, format!("Could not start review of {}: {}", artifact.url, e)),
        }
    }

    async fn collect_pipelines(&mut self) {
        for id in self.state.finished_pipelines() {
            let Some(handle) = self.state.take_pipeline(&id) else {
                continue;
            };
            let outcome = match handle.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => RemediationOutcome::failed(e.to_string()),
                Err(join_error) => {
                    RemediationOutcome::failed(format!("Pipeline crashed: {}", join_error))
                }
            };
            match outcome {
                RemediationOutcome::Landed => self.complete(&id),
                RemediationOutcome::Failed { error } => self.fail(&id, error),
            }
        }
    }

    fn complete(&mut self, id: &TaskId) {
        flog!("Task {} completed", id);
        self.state.mark_completed(id);
        self.events.emit(SchedulerEvent::TaskCompleted {
            task_id: id.clone(),
        });

        let url = self
            .state
            .artifact(id)
            .map(|a| a.url.clone())
            .unwrap_or_default();
        if let (Some(source), true) = (self.collaborators.source.clone(), id.issue_number().is_some()) {
            let id = id.clone();
            self.side_jobs.spawn(async move {
                if let Err(e) = source.mark_complete(&id, &url).await {
                    flog_warn!("Failed to mark {} complete: {}", id, e);
                }
            });
        }
    }

    fn fail(&mut self, id: &TaskId, error: String) {
        self.state.mark_failed(id, error.clone());
        let blocked = self.graph.dependents_of(id);
        if !blocked.is_empty() {
            flog_warn!(
                "Task {} failed; {} dependent task(s) can no longer run: {:?}",
                id,
                blocked.len(),
                blocked
            );
        }
        self.events.emit(SchedulerEvent::TaskFailed {
            task_id: id.clone(),
            error: error.clone(),
        });

        if let (Some(source), true) = (self.collaborators.source.clone(), id.issue_number().is_some()) {
            let id = id.clone();
            self.side_jobs.spawn(async move {
                if let Err(e) = source.mark_failed(&id, &error).await {
                    flog_warn!("Failed to mark {} failed: {}", id, e);
                }
            });
        }
    }

    fn write_status(&self, halt: Option<HaltReason>) {
        let Some(path) = &self.settings.status_path else {
            return;
        };
        if let Err(e) = self.state.snapshot(halt).write_atomic(path) {
            flog_warn!("Failed to write status to {}: {}", path.display(), e);
        }
    }

    /// Wait for cancelled jobs to finish their cleanup, up to the drain
    /// deadline. Attempts are recorded but never retried or reviewed; their
    /// tasks stay unsettled unless a pipeline still managed to land.
    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + self.settings.drain_timeout;

        for (id, mut execution) in self.state.drain_executions() {
            match tokio::time::timeout_at(deadline, &mut execution.handle).await {
                Ok(Ok(Ok((result, task)))) => {
                    self.state.replace_task(task);
                    self.state.record_result(&result);
                    if let ExecutionOutcome::Succeeded {
                        artifact: Some(artifact),
                    } = &result.outcome
                    {
                        flog_warn!(
                            "Task {} produced {} but the run ended before review",
                            id,
                            artifact.url
                        );
                    }
                }
                Ok(Ok(Err(e))) => flog_debug!("Attempt for {} never started: {}", id, e),
                Ok(Err(join_error)) => {
                    flog_warn!("Worker for {} crashed while stopping: {}", id, join_error)
                }
                Err(_) => {
                    flog_warn!("Worker for {} did not stop in time; aborting", id);
                    execution.handle.abort();
                }
            }
        }

        for (id, mut handle) in self.state.drain_pipelines() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(RemediationOutcome::Landed))) => self.complete(&id),
                Ok(Ok(Ok(RemediationOutcome::Failed { error }))) => {
                    flog_warn!("Review of {} stopped: {}", id, error)
                }
                Ok(Ok(Err(e))) => flog_debug!("Review of {} never started: {}", id, e),
                Ok(Err(join_error)) => {
                    flog_warn!("Pipeline for {} crashed while stopping: {}", id, join_error)
                }
                Err(_) => {
                    flog_warn!("Pipeline for {} did not stop in time; aborting", id);
                    handle.abort();
                }
            }
        }
    }

    async fn finish(mut self, halt: HaltReason) -> Result<RunReport> {
        match halt {
            HaltReason::Cancelled => {
                flog_warn!("Run cancelled; draining in-flight work");
                self.pool.close();
                self.drain().await;
            }
            HaltReason::Deadlock | HaltReason::MaxPriorityReached | HaltReason::AllSettled => {}
        }
        while self.side_jobs.join_next().await.is_some() {}

        self.write_status(Some(halt));
        self.events.emit(SchedulerEvent::Halted { reason: halt });

        let mut completed: Vec<TaskId> = self.state.completed().iter().cloned().collect();
        completed.sort();
        let mut failed: Vec<(TaskId, String)> = self
            .state
            .failed()
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        failed.sort();
        let report = RunReport {
            completed,
            failed,
            unsettled: self.state.unsettled(),
            halt,
            artifacts: self.state.artifacts().to_vec(),
            snapshot: self.state.snapshot(Some(halt)),
        };
        flog!(
            "Run finished ({:?}): {} completed, {} failed, {} unsettled",
            report.halt,
            report.completed.len(),
            report.failed.len(),
            report.unsettled.len()
        );
        Ok(report)
    }
}
