//! Orchestration layer: runs tasks through isolated workers, remediates
//! the resulting change requests and schedules the whole plan.
//!
//! The [`Scheduler`] owns all run state. Workers and remediation pipelines
//! run as jobs on a shared [`WorkerPool`] and talk to the outside world only
//! through the traits in [`crate::ports`].

pub mod agent;
pub mod conflict;
pub mod decompose;
pub mod enrich;
pub mod event;
pub mod fixer;
pub mod followup;
pub mod pipeline;
pub mod planner;
pub mod pool;
pub mod retry;
pub mod review;
pub mod run_state;
pub mod scheduler;
pub mod status;
pub mod worker;

pub use agent::ClaudeCli;
pub use conflict::AgentConflictResolver;
pub use decompose::Decomposer;
pub use enrich::ArchitectEnricher;
pub use event::{EventSink, HaltReason, SchedulerEvent};
pub use fixer::AgentFixer;
pub use pipeline::{FixBudget, FixDecision, Pipeline, PipelineSettings};
pub use planner::{plan, PlanReport};
pub use pool::WorkerPool;
pub use retry::RetryPolicy;
pub use review::AgentReviewer;
pub use run_state::RunState;
pub use scheduler::{RunReport, Scheduler, SchedulerSettings};
pub use status::RunSnapshot;
pub use worker::{Worker, WorkerSettings};
