//! Test fixtures for integration tests.
//!
//! Provides in-memory stand-ins for every collaborator:
//! - `FakeAgent` records each invocation and can fail chosen tasks
//! - `ReplyAgent` answers every prompt with fixed text
//! - `FakeVcs` tracks workspaces, commits, reverts and pushes, and can be
//!   scripted to fail setup, report no commits or reject pushes
//! - `FakeHosting` hands out change request and issue numbers, scripted
//!   mergeability, and can pretend labels are missing
//! - `ScriptedEvaluator` replays a queue of reviews
//! - `FakeFixer`, `FakeResolver` and `FakeSource` count their calls

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;

use foreman::core::{Artifact, Task, TaskId, WorkItem};
use foreman::orchestration::{
    PipelineSettings, RetryPolicy, RunReport, Scheduler, SchedulerSettings, Worker,
    WorkerSettings,
};
use foreman::ports::{
    AgentRequest, AgentRun, ChangeRequest, CodeAgent, Collaborators, ConflictReport,
    ConflictResolver, Evaluator, Finding, FixReport, Fixer, Hosting, Mergeability, NewIssue,
    Review, ReviewMaterial, Severity, VersionControl, Verdict, WorkItemSource,
};
use foreman::{Error, Result};

// ========== Reviews ==========

pub fn finding(severity: Severity, text: &str) -> Finding {
    Finding {
        file: "src/lib.rs".to_string(),
        line: Some(10),
        severity,
        text: text.to_string(),
    }
}

pub fn approve() -> Review {
    Review {
        claimed: Verdict::Approve,
        summary: "Looks good".to_string(),
        findings: Vec::new(),
    }
}

/// A review with `n` error findings.
pub fn errors(n: usize) -> Review {
    Review {
        claimed: Verdict::RequestChanges,
        summary: format!("{} problem(s)", n),
        findings: (0..n)
            .map(|i| finding(Severity::Error, &format!("problem number {}", i)))
            .collect(),
    }
}

// ========== Agent ==========

/// One recorded agent invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Worktree folder name, `<task-id>-<slug>[-retry-N]`.
    pub workspace: String,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Default)]
pub struct FakeAgent {
    /// Remaining failures per task id.
    failures: Mutex<HashMap<String, u32>>,
    delay: Duration,
    pub invocations: Mutex<Vec<Invocation>>,
}

impl FakeAgent {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Make the next `times` executions of `task_id` fail.
    pub fn fail(&self, task_id: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(task_id.to_string(), times);
    }

    pub fn workspaces(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.workspace.clone())
            .collect()
    }

    /// Recorded invocations whose workspace starts with `task_id`.
    pub fn runs_of(&self, task_id: &str) -> Vec<Invocation> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.workspace.starts_with(&format!("{}-", task_id)))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CodeAgent for FakeAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentRun> {
        let workspace = request
            .cwd
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let started = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failing = {
            let mut failures = self.failures.lock().unwrap();
            let key = failures
                .keys()
                .find(|id| workspace.starts_with(&format!("{}-", id)))
                .cloned();
            match key.and_then(|k| failures.get_mut(&k)) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };

        self.invocations.lock().unwrap().push(Invocation {
            workspace,
            started,
            finished: Instant::now(),
        });
        Ok(AgentRun {
            exit_code: if failing { 1 } else { 0 },
            output: "done".to_string(),
            stderr: if failing { "boom".to_string() } else { String::new() },
            cost_usd: Some(0.25),
            num_turns: Some(3),
        })
    }
}

/// Answers every prompt with the same text and keeps the prompts.
pub struct ReplyAgent {
    reply: String,
    prompts: Mutex<Vec<String>>,
}

impl ReplyAgent {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeAgent for ReplyAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentRun> {
        self.prompts.lock().unwrap().push(request.prompt);
        Ok(AgentRun {
            output: self.reply.clone(),
            ..AgentRun::default()
        })
    }
}

// ========== Version control ==========

#[derive(Default)]
pub struct FakeVcs {
    pub prepared: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub syncs: AtomicUsize,
    pub released: AtomicUsize,
    /// Messages of commits that actually recorded something.
    pub commits: Mutex<Vec<String>>,
    pub reverted: Mutex<Vec<String>>,
    pub pushes: AtomicUsize,
    /// Changed files reported for every workspace; `src/lib.rs` when unset.
    changes: Mutex<Option<Vec<String>>>,
    /// Uncommitted edits left by a revert.
    dirty: AtomicBool,
    fail_prepare: AtomicBool,
    no_commits: AtomicBool,
    /// Pushes still to reject with a transient error.
    push_failures: AtomicUsize,
    /// Paths left in conflict by merging base into a workspace.
    conflicts: Mutex<Vec<String>>,
    no_incoming: AtomicBool,
}

impl FakeVcs {
    pub fn script_changes(&self, files: &[&str]) {
        *self.changes.lock().unwrap() = Some(files.iter().map(|f| f.to_string()).collect());
    }

    pub fn fail_prepare(&self) {
        self.fail_prepare.store(true, Ordering::SeqCst);
    }

    pub fn report_no_commits(&self) {
        self.no_commits.store(true, Ordering::SeqCst);
    }

    pub fn fail_pushes(&self, times: usize) {
        self.push_failures.store(times, Ordering::SeqCst);
    }

    pub fn script_conflicts(&self, files: &[&str]) {
        *self.conflicts.lock().unwrap() = files.iter().map(|f| f.to_string()).collect();
    }

    /// Make the incoming-change summary unavailable.
    pub fn fail_incoming(&self) {
        self.no_incoming.store(true, Ordering::SeqCst);
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn prepare_workspace(&self, branch: &str, _path: &Path) -> Result<()> {
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::Execution("fatal: invalid reference: main".to_string()));
        }
        self.prepared.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn checkout_workspace(&self, _branch: &str, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn release_workspace(&self, _path: &Path) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_pending(&self, _path: &Path, message: &str) -> Result<bool> {
        let committed = self.dirty.swap(false, Ordering::SeqCst);
        if committed {
            self.commits.lock().unwrap().push(message.to_string());
        }
        Ok(committed)
    }

    async fn commits_ahead(&self, _path: &Path) -> Result<usize> {
        Ok(if self.no_commits.load(Ordering::SeqCst) { 0 } else { 1 })
    }

    async fn changed_files(&self, _path: &Path) -> Result<Vec<String>> {
        Ok(self
            .changes
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| vec!["src/lib.rs".to_string()]))
    }

    async fn revert_file(&self, _path: &Path, file: &str) -> Result<()> {
        if let Some(changes) = self.changes.lock().unwrap().as_mut() {
            changes.retain(|f| f != file);
        }
        self.reverted.lock().unwrap().push(file.to_string());
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn push(&self, _path: &Path, _branch: &str) -> Result<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let rejected = self
            .push_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(Error::Transient("remote hung up unexpectedly".to_string()));
        }
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn merge_base_into(&self, _path: &Path) -> Result<Vec<String>> {
        let conflicts = self.conflicts.lock().unwrap().clone();
        if !conflicts.is_empty() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(conflicts)
    }

    async fn incoming_changes(&self, _path: &Path) -> Result<String> {
        if self.no_incoming.load(Ordering::SeqCst) {
            return Err(Error::Execution("unknown revision origin/main".to_string()));
        }
        Ok("abc123 Rename config loader".to_string())
    }

    async fn sync_base(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ========== Hosting ==========

#[derive(Default)]
pub struct FakeHosting {
    next_number: AtomicU64,
    /// Mergeability answers in order; `Mergeable` once exhausted.
    mergeability: Mutex<VecDeque<Mergeability>>,
    pub created: Mutex<Vec<ChangeRequest>>,
    pub merged: Mutex<Vec<u64>>,
    pub comments: Mutex<Vec<(u64, String)>>,
    pub issues: Mutex<Vec<NewIssue>>,
    pub issue_comments: Mutex<Vec<(u64, String)>>,
    /// `(issue, removed, added)` label swaps.
    pub relabels: Mutex<Vec<(u64, String, String)>>,
    pub labels_created: Mutex<Vec<String>>,
    /// When set, no label exists and labelled change requests are refused.
    missing_labels: AtomicBool,
    /// Issue titles whose creation fails.
    rejected_titles: Mutex<Vec<String>>,
}

impl FakeHosting {
    pub fn without_labels(&self) {
        self.missing_labels.store(true, Ordering::SeqCst);
    }

    pub fn reject_issue(&self, title: &str) {
        self.rejected_titles.lock().unwrap().push(title.to_string());
    }

    pub fn script_mergeability(&self, answers: impl IntoIterator<Item = Mergeability>) {
        self.mergeability.lock().unwrap().extend(answers);
    }

    pub fn merged(&self) -> Vec<u64> {
        self.merged.lock().unwrap().clone()
    }
}

#[async_trait]
impl Hosting for FakeHosting {
    async fn create_change_request(&self, request: &ChangeRequest) -> Result<Artifact> {
        if self.missing_labels.load(Ordering::SeqCst) {
            if let Some(label) = &request.label {
                return Err(Error::LabelMissing(format!(
                    "could not add label: '{}' not found",
                    label
                )));
            }
        }
        let number = self.next_number.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.lock().unwrap().push(request.clone());
        Artifact::from_url(&format!("https://github.com/o/r/pull/{}", number), &request.head)
            .ok_or_else(|| Error::Execution("bad url".to_string()))
    }

    async fn review_material(&self, _artifact: &Artifact) -> Result<ReviewMaterial> {
        Ok(ReviewMaterial {
            title: "change".to_string(),
            body: String::new(),
            diff: "+fn a() {}".to_string(),
            files: vec!["src/lib.rs".to_string()],
            contents: vec![("src/lib.rs".to_string(), "fn a() {}".to_string())],
        })
    }

    async fn mergeability(&self, _artifact: &Artifact) -> Result<Mergeability> {
        Ok(self
            .mergeability
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Mergeability::Mergeable))
    }

    async fn merge(&self, artifact: &Artifact) -> Result<()> {
        self.merged.lock().unwrap().push(artifact.number);
        Ok(())
    }

    async fn comment(&self, artifact: &Artifact, body: &str) -> Result<()> {
        self.comments
            .lock()
            .unwrap()
            .push((artifact.number, body.to_string()));
        Ok(())
    }

    async fn open_issue_titles(&self) -> Result<Vec<String>> {
        Ok(self
            .issues
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.title.clone())
            .collect())
    }

    async fn label_exists(&self, _label: &str) -> Result<bool> {
        Ok(!self.missing_labels.load(Ordering::SeqCst))
    }

    async fn create_issue(&self, issue: &NewIssue) -> Result<String> {
        if self.rejected_titles.lock().unwrap().contains(&issue.title) {
            return Err(Error::Execution(format!("could not create {:?}", issue.title)));
        }
        let mut issues = self.issues.lock().unwrap();
        issues.push(issue.clone());
        Ok(format!("https://github.com/o/r/issues/{}", 100 + issues.len()))
    }

    async fn comment_issue(&self, number: u64, body: &str) -> Result<()> {
        self.issue_comments
            .lock()
            .unwrap()
            .push((number, body.to_string()));
        Ok(())
    }

    async fn relabel_issue(&self, number: u64, remove: &str, add: &str) -> Result<()> {
        self.relabels
            .lock()
            .unwrap()
            .push((number, remove.to_string(), add.to_string()));
        Ok(())
    }

    async fn create_label(&self, name: &str, _color: &str, _description: &str) -> Result<()> {
        self.labels_created.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

// ========== Review, fix, conflicts ==========

/// Replays queued reviews; approves once the queue is empty, or repeats
/// the fallback when one is set.
#[derive(Default)]
pub struct ScriptedEvaluator {
    queue: Mutex<VecDeque<Review>>,
    fallback: Mutex<Option<Review>>,
    pub calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn script(&self, reviews: impl IntoIterator<Item = Review>) {
        self.queue.lock().unwrap().extend(reviews);
    }

    pub fn always(&self, review: Review) {
        *self.fallback.lock().unwrap() = Some(review);
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, _artifact: &Artifact) -> Result<Review> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(review) = self.queue.lock().unwrap().pop_front() {
            return Ok(review);
        }
        Ok(self.fallback.lock().unwrap().clone().unwrap_or_else(approve))
    }
}

#[derive(Default)]
pub struct FakeFixer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Fixer for FakeFixer {
    async fn fix(&self, _artifact: &Artifact, _review: &Review) -> Result<FixReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FixReport {
            success: true,
            summary: "fixed".to_string(),
            error: None,
        })
    }
}

pub struct FakeResolver {
    pub calls: AtomicUsize,
    succeed: bool,
}

impl FakeResolver {
    pub fn new(succeed: bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            succeed,
        }
    }
}

#[async_trait]
impl ConflictResolver for FakeResolver {
    async fn resolve(&self, _artifact: &Artifact) -> Result<ConflictReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ConflictReport {
            success: self.succeed,
            resolved_files: vec!["src/lib.rs".to_string()],
            error: (!self.succeed).then(|| "markers remain".to_string()),
        })
    }
}

#[derive(Default)]
pub struct FakeSource {
    pub completed: Mutex<Vec<(TaskId, String)>>,
    pub failed: Mutex<Vec<(TaskId, String)>>,
}

#[async_trait]
impl WorkItemSource for FakeSource {
    async fn list_ready_items(&self, _label: &str) -> Result<Vec<WorkItem>> {
        Ok(Vec::new())
    }

    async fn mark_complete(&self, task_id: &TaskId, artifact_url: &str) -> Result<()> {
        self.completed
            .lock()
            .unwrap()
            .push((task_id.clone(), artifact_url.to_string()));
        Ok(())
    }

    async fn mark_failed(&self, task_id: &TaskId, error: &str) -> Result<()> {
        self.failed
            .lock()
            .unwrap()
            .push((task_id.clone(), error.to_string()));
        Ok(())
    }
}

// ========== Harness ==========

/// All fakes for one run plus a scratch directory for worktrees, logs and
/// the status file.
pub struct Harness {
    pub dir: TempDir,
    pub agent: Arc<FakeAgent>,
    pub vcs: Arc<FakeVcs>,
    pub hosting: Arc<FakeHosting>,
    pub evaluator: Arc<ScriptedEvaluator>,
    pub fixer: Arc<FakeFixer>,
    pub resolver: Arc<FakeResolver>,
    pub source: Arc<FakeSource>,
    pub max_workers: usize,
    pub max_retries: u32,
    pub max_priority: Option<u32>,
    pub max_fix_attempts: u32,
    pub extra_fix_buffer: u32,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_agent(FakeAgent::default())
    }

    pub fn with_agent(agent: FakeAgent) -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
            agent: Arc::new(agent),
            vcs: Arc::new(FakeVcs::default()),
            hosting: Arc::new(FakeHosting::default()),
            evaluator: Arc::new(ScriptedEvaluator::default()),
            fixer: Arc::new(FakeFixer::default()),
            resolver: Arc::new(FakeResolver::new(true)),
            source: Arc::new(FakeSource::default()),
            max_workers: 2,
            max_retries: 2,
            max_priority: None,
            max_fix_attempts: 2,
            extra_fix_buffer: 3,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            agent: self.agent.clone(),
            vcs: self.vcs.clone(),
            hosting: self.hosting.clone(),
            evaluator: self.evaluator.clone(),
            fixer: self.fixer.clone(),
            resolver: self.resolver.clone(),
            source: Some(self.source.clone()),
            enricher: None,
        }
    }

    pub fn status_path(&self) -> std::path::PathBuf {
        self.dir.path().join("status.json")
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_workers: self.max_workers,
            max_retries: self.max_retries,
            max_priority: self.max_priority,
            poll_interval: Duration::from_millis(10),
            status_path: Some(self.status_path()),
            pool_size: self.max_workers * 2,
            drain_timeout: Duration::from_secs(5),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            base_branch: "main".to_string(),
            worktree_dir: self.dir.path().join("worktrees"),
            log_dir: self.dir.path().join("logs"),
            timeout: Duration::from_secs(5),
            allowed_tools: Vec::new(),
            pr_label: Some("agent-created".to_string()),
            retry: RetryPolicy::immediate(2),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            max_fix_attempts: self.max_fix_attempts,
            extra_fix_buffer: self.extra_fix_buffer,
            ..PipelineSettings::default()
        }
        .without_delays()
    }

    pub fn worker(&self, task: Task) -> Worker {
        Worker::new(task, 0, &self.collaborators(), Arc::new(self.worker_settings()))
    }

    /// Attempt logs written under the scratch directory.
    pub fn attempt_logs(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.dir.path().join("logs")) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|x| x == "log"))
            .map(|e| std::fs::read_to_string(e.path()).unwrap())
            .collect()
    }

    pub fn scheduler(&self, tasks: Vec<Task>) -> Scheduler {
        Scheduler::new(
            tasks,
            self.collaborators(),
            self.scheduler_settings(),
            self.worker_settings(),
            self.pipeline_settings(),
        )
        .expect("valid plan")
    }

    /// Run `tasks` to completion, failing the test if it takes too long.
    pub async fn run(&self, tasks: Vec<Task>) -> RunReport {
        tokio::time::timeout(Duration::from_secs(20), self.scheduler(tasks).run())
            .await
            .expect("run finished in time")
            .expect("run succeeded")
    }
}
