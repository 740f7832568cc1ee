//! Lifecycle events emitted during a run.
//!
//! Consumers (the CLI, tests) subscribe through an mpsc channel. Emission
//! never blocks the control loop: when the consumer lags behind, events are
//! dropped.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::TaskId;
use crate::ports::Verdict;

/// Why the scheduling loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// Every task is completed or failed.
    AllSettled,
    /// Nothing in flight and nothing eligible, yet tasks remain.
    Deadlock,
    /// The configured maximum priority tier has settled.
    MaxPriorityReached,
    /// Shutdown was requested.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    TaskStarted {
        task_id: TaskId,
        branch: String,
        attempt: u32,
    },
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    ArtifactProduced {
        task_id: TaskId,
        url: String,
    },
    ReviewStarted {
        task_id: TaskId,
        round: u32,
    },
    ReviewFinished {
        task_id: TaskId,
        verdict: Verdict,
        errors: usize,
    },
    FixStarted {
        task_id: TaskId,
        attempt: u32,
    },
    ConflictsDetected {
        task_id: TaskId,
    },
    Merged {
        task_id: TaskId,
        url: String,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TierStarted {
        priority: u32,
    },
    Halted {
        reason: HaltReason,
    },
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HaltReason::AllSettled => "all tasks settled",
            HaltReason::Deadlock => "deadlock: remaining tasks can never become eligible",
            HaltReason::MaxPriorityReached => "maximum priority reached",
            HaltReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

impl fmt::Display for SchedulerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerEvent::TaskStarted {
                task_id,
                branch,
                attempt,
            } => write!(f, "[{}] started on {} (attempt {})", task_id, branch, attempt + 1),
            SchedulerEvent::TaskRetrying {
                task_id,
                attempt,
                error,
            } => write!(f, "[{}] retry {}: {}", task_id, attempt, error),
            SchedulerEvent::ArtifactProduced { task_id, url } => {
                write!(f, "[{}] opened {}", task_id, url)
            }
            SchedulerEvent::ReviewStarted { task_id, round } => {
                write!(f, "[{}] review round {}", task_id, round)
            }
            SchedulerEvent::ReviewFinished {
                task_id,
                verdict,
                errors,
            } => write!(f, "[{}] review: {:?} ({} error(s))", task_id, verdict, errors),
            SchedulerEvent::FixStarted { task_id, attempt } => {
                write!(f, "[{}] fix attempt {}", task_id, attempt)
            }
            SchedulerEvent::ConflictsDetected { task_id } => {
                write!(f, "[{}] merge conflicts detected", task_id)
            }
            SchedulerEvent::Merged { task_id, url } => write!(f, "[{}] merged {}", task_id, url),
            SchedulerEvent::TaskCompleted { task_id } => write!(f, "[{}] completed", task_id),
            SchedulerEvent::TaskFailed { task_id, error } => {
                write!(f, "[{}] failed: {}", task_id, error)
            }
            SchedulerEvent::TierStarted { priority } => write!(f, "priority tier {}", priority),
            SchedulerEvent::Halted { reason } => write!(f, "halted: {}", reason),
        }
    }
}

/// Optional, non-blocking event sender.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::Sender<SchedulerEvent>>);

impl EventSink {
    pub fn new(tx: mpsc::Sender<SchedulerEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.try_send(event);
        }
    }
}
