//! Integration test suite for foreman.
//!
//! These tests drive the scheduler and the remediation pipeline end to end
//! against in-memory collaborators, so no agent, git remote or hosting
//! service is needed.
//!
//! # Test Categories
//!
//! - `scheduler_e2e`: Full runs covering locks, retries, tiers and halts
//! - `pipeline_e2e`: Review, fix, conflict and merge sequences
//! - `planner`: Dry-run planning from plan files
//! - `worker`: Single attempts, allowlist reverts and publish failures
//! - `conflict`: Agent conflict resolution over a scripted merge
//! - `decompose`: Splitting vague issues into sub-issues

mod fixtures;

mod conflict;
mod decompose;
mod pipeline_e2e;
mod planner;
mod scheduler_e2e;
mod worker;
