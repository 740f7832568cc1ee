//! Run snapshot written to `status.json`.
//!
//! The snapshot is rewritten on every scheduler tick so that dashboards and
//! other tools can poll it. Writes go through a temporary file and a rename
//! so a reader never sees a half-written document.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestration::event::HaltReason;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: usize,
    pub queued: usize,
    pub active: usize,
    pub reviewing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    Reviewing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub status: WorkerState,
    pub retries: u32,
    pub elapsed_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskTiming {
    pub elapsed_seconds: Option<f64>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_elapsed_seconds: f64,
    pub total_cost_usd: f64,
    pub total_prompts: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub task_id: String,
    pub pr_url: String,
    pub pr_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub updated_at: DateTime<Utc>,
    pub tasks: TaskCounts,
    pub workers: BTreeMap<String, WorkerStatus>,
    pub task_timing: BTreeMap<String, TaskTiming>,
    pub summary: Summary,
    pub current_priority: Option<u32>,
    pub retries: BTreeMap<String, u32>,
    pub prs: Vec<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt: Option<HaltReason>,
}

impl RunSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)? + "\n")
    }

    /// Write the snapshot, replacing any previous one atomically.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, self.to_json()?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
