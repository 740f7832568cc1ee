//! Core domain models: tasks, plans, results and the eligibility rule.

pub mod issue;
pub mod plan;
pub mod resolver;
pub mod result;
pub mod task;

pub use issue::{tasks_from_items, WorkItem};
pub use plan::load_plan;
pub use resolver::{ready_tasks, tiers, DependencyGraph};
pub use result::{Artifact, ExecutionOutcome, ExecutionResult, RemediationOutcome};
pub use task::{normalize_path, Task, TaskId};
