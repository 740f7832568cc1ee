//! Task data model.
//!
//! A task is one unit of work handed to a code agent. Tasks are loaded once
//! per run and never mutated by the scheduler; enrichment produces a new
//! value via [`Task::with_context`].

use serde::{Deserialize, Serialize};

/// Unique identifier for a task within a loaded batch.
///
/// Plan files choose their own ids; issue-sourced tasks use `issue-<N>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Issue number for ids of the form `issue-<N>`.
    pub fn issue_number(&self) -> Option<u64> {
        self.0.strip_prefix("issue-")?.parse().ok()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

fn default_priority() -> u32 {
    1
}

fn default_max_turns() -> u32 {
    50
}

fn default_model() -> String {
    "sonnet".to_string()
}

/// A single unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Files the task may touch. Empty means unrestricted.
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Lower runs earlier.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            files_touched: Vec::new(),
            depends_on: Vec::new(),
            priority: default_priority(),
            max_turns: default_max_turns(),
            model: default_model(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.files_touched = files.into_iter().map(|f| normalize_path(f.as_ref())).collect();
        self
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Copy of this task with extra planning context placed ahead of the
    /// original description.
    pub fn with_context(&self, context: &str) -> Self {
        let mut task = self.clone();
        task.description = format!(
            "## Architect Spec\n{}\n\n## Original Issue\n{}",
            context.trim(),
            self.description
        );
        task
    }

    /// Whether the two tasks declare any file in common.
    ///
    /// Tasks with no declared files never conflict.
    pub fn conflicts_with(&self, other: &Task) -> bool {
        self.files_touched
            .iter()
            .any(|f| other.files_touched.contains(f))
    }

    /// Whether `path` is inside this task's allowlist.
    pub fn allows(&self, path: &str) -> bool {
        self.files_touched.is_empty() || self.files_touched.contains(&normalize_path(path))
    }
}

/// Normalize a repository-relative path for exact comparison.
///
/// Backslashes become `/`, leading `./` segments and duplicate separators are
/// removed. No basename or suffix matching is ever applied.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            other => parts.push(other),
        }
    }
    parts.join("/")
}
