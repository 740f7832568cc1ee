//! Outcomes of executing a task and of remediating its artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;

/// A published change request produced by an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub number: u64,
    pub url: String,
    /// Head branch of the change request.
    pub branch: String,
}

impl Artifact {
    /// Parse the trailing number out of a change request URL such as
    /// `https://github.com/o/r/pull/17`.
    pub fn from_url(url: &str, branch: &str) -> Option<Self> {
        let number = url.trim().trim_end_matches('/').rsplit('/').next()?.parse().ok()?;
        Some(Self {
            number,
            url: url.trim().to_string(),
            branch: branch.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ExecutionOutcome {
    Succeeded { artifact: Option<Artifact> },
    Failed { error: String },
}

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub branch: String,
    pub outcome: ExecutionOutcome,
    /// Agent output, when the agent ran.
    pub output: Option<String>,
    pub files_changed: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Succeeded { .. })
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        match &self.outcome {
            ExecutionOutcome::Succeeded { artifact } => artifact.as_ref(),
            ExecutionOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            ExecutionOutcome::Failed { error } => Some(error),
            ExecutionOutcome::Succeeded { .. } => None,
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Terminal state of the review/fix/merge pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RemediationOutcome {
    Landed,
    Failed { error: String },
}

impl RemediationOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }
}
