//! Boundaries to the outside world.
//!
//! The scheduler and pipeline only talk to collaborators through these
//! traits. Default implementations drive the `claude`, `git` and `gh`
//! command-line tools; tests substitute in-memory fakes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{tasks_from_items, Artifact, Task, TaskId, WorkItem};
use crate::Result;

// ========== Code agent ==========

/// One headless agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub model: String,
    pub max_turns: u32,
    /// Empty means the agent's own default tool set.
    pub allowed_tools: Vec<String>,
    pub timeout: Duration,
}

/// What an agent invocation reported back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentRun {
    pub exit_code: i32,
    /// Final result text.
    pub output: String,
    pub stderr: String,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
}

impl AgentRun {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait CodeAgent: Send + Sync {
    /// Run the agent to completion. A timeout is reported as
    /// [`crate::Error::Timeout`]; a non-zero exit is reported in the run.
    async fn invoke(&self, request: AgentRequest) -> Result<AgentRun>;
}

// ========== Version control ==========

#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Create `branch` from the base branch and check it out at `path`.
    async fn prepare_workspace(&self, branch: &str, path: &Path) -> Result<()>;
    /// Check out an existing (possibly remote-only) branch at `path`.
    async fn checkout_workspace(&self, branch: &str, path: &Path) -> Result<()>;
    async fn release_workspace(&self, path: &Path) -> Result<()>;
    /// Stage everything (including deletions) and commit. Returns `false`
    /// when there was nothing to commit.
    async fn commit_pending(&self, path: &Path, message: &str) -> Result<bool>;
    /// Number of commits on the workspace branch not on the base branch.
    async fn commits_ahead(&self, path: &Path) -> Result<usize>;
    /// Files that differ between the base branch and the workspace head.
    async fn changed_files(&self, path: &Path) -> Result<Vec<String>>;
    /// Restore `file` to its base-branch content, deleting it if the base
    /// branch does not have it.
    async fn revert_file(&self, path: &Path, file: &str) -> Result<()>;
    async fn push(&self, path: &Path, branch: &str) -> Result<()>;
    /// Delete a branch locally and on the remote. Missing branches are fine.
    async fn delete_branch(&self, branch: &str) -> Result<()>;
    /// Merge the remote base branch into the workspace. Returns the paths
    /// left in conflict (empty on a clean merge).
    async fn merge_base_into(&self, path: &Path) -> Result<Vec<String>>;
    /// Summary of base-branch commits the workspace head does not have yet.
    async fn incoming_changes(&self, path: &Path) -> Result<String>;
    /// Bring the local base branch up to date after a merge.
    async fn sync_base(&self) -> Result<()>;
}

// ========== Hosting service ==========

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRequest {
    pub title: String,
    pub body: String,
    pub base: String,
    pub head: String,
    pub label: Option<String>,
}

/// Everything an evaluator needs to judge a change request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewMaterial {
    pub title: String,
    pub body: String,
    pub diff: String,
    pub files: Vec<String>,
    /// Full head-branch content of each changed file that could be read.
    pub contents: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mergeability {
    Mergeable,
    Conflicting,
    Unknown,
}

impl Mergeability {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "MERGEABLE" => Mergeability::Mergeable,
            "CONFLICTING" => Mergeability::Conflicting,
            _ => Mergeability::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[async_trait]
pub trait Hosting: Send + Sync {
    /// Open a change request and return its reference.
    async fn create_change_request(&self, request: &ChangeRequest) -> Result<Artifact>;
    async fn review_material(&self, artifact: &Artifact) -> Result<ReviewMaterial>;
    async fn mergeability(&self, artifact: &Artifact) -> Result<Mergeability>;
    /// Squash-merge and delete the head branch.
    async fn merge(&self, artifact: &Artifact) -> Result<()>;
    async fn comment(&self, artifact: &Artifact, body: &str) -> Result<()>;
    async fn open_issue_titles(&self) -> Result<Vec<String>>;
    async fn label_exists(&self, label: &str) -> Result<bool>;
    /// Create an issue and return its URL.
    async fn create_issue(&self, issue: &NewIssue) -> Result<String>;
    async fn comment_issue(&self, number: u64, body: &str) -> Result<()>;
    /// Swap one label for another on an issue.
    async fn relabel_issue(&self, number: u64, remove: &str, add: &str) -> Result<()>;
    async fn create_label(&self, name: &str, color: &str, description: &str) -> Result<()>;
}

// ========== Work items ==========

#[async_trait]
pub trait WorkItemSource: Send + Sync {
    async fn list_ready_items(&self, label: &str) -> Result<Vec<WorkItem>>;
    /// Record success and resolve the item.
    async fn mark_complete(&self, task_id: &TaskId, artifact_url: &str) -> Result<()>;
    /// Record failure; the item stays open.
    async fn mark_failed(&self, task_id: &TaskId, error: &str) -> Result<()>;

    async fn fetch_tasks(&self, label: &str) -> Result<Vec<Task>> {
        let items = self.list_ready_items(label).await?;
        Ok(tasks_from_items(&items))
    }
}

// ========== Review, fix, conflicts ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Suggestion,
}

impl Severity {
    /// Unknown severities degrade to `Suggestion`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "error" => Severity::Error,
            "warning" => Severity::Warning,
            _ => Severity::Suggestion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    RequestChanges,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub file: String,
    pub line: Option<u32>,
    pub severity: Severity,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    /// Verdict as claimed by the evaluator; see [`Review::verdict`].
    pub claimed: Verdict,
    pub summary: String,
    pub findings: Vec<Finding>,
}

impl Review {
    pub fn error_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .count()
    }

    /// Changes are requested iff at least one finding is an error,
    /// regardless of what the evaluator claimed.
    pub fn verdict(&self) -> Verdict {
        if self.error_count() > 0 {
            Verdict::RequestChanges
        } else {
            Verdict::Approve
        }
    }
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, artifact: &Artifact) -> Result<Review>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixReport {
    pub success: bool,
    pub summary: String,
    pub error: Option<String>,
}

#[async_trait]
pub trait Fixer: Send + Sync {
    async fn fix(&self, artifact: &Artifact, review: &Review) -> Result<FixReport>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictReport {
    pub success: bool,
    pub resolved_files: Vec<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, artifact: &Artifact) -> Result<ConflictReport>;
}

/// Optional pre-dispatch enrichment of a task description.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Extra context for `task`, or `None` to leave it unchanged.
    async fn enrich(&self, task: &Task) -> Result<Option<String>>;
}

/// The full set of collaborators a run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn CodeAgent>,
    pub vcs: Arc<dyn VersionControl>,
    pub hosting: Arc<dyn Hosting>,
    pub evaluator: Arc<dyn Evaluator>,
    pub fixer: Arc<dyn Fixer>,
    pub resolver: Arc<dyn ConflictResolver>,
    pub source: Option<Arc<dyn WorkItemSource>>,
    pub enricher: Option<Arc<dyn Enricher>>,
}
