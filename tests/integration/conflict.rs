//! Agent conflict resolution against a scripted merge.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use foreman::core::Artifact;
use foreman::orchestration::{AgentConflictResolver, RetryPolicy};
use foreman::ports::ConflictResolver;

use crate::fixtures::{Harness, ReplyAgent};

const CONFLICTED: &str = "<<<<<<< HEAD\nfn a() {}\n=======\nfn a() -> u8 { 1 }\n>>>>>>> main\n";

fn artifact() -> Artifact {
    Artifact::from_url("https://github.com/o/r/pull/9", "agent/t-task").unwrap()
}

/// Harness with `src/a.rs` in conflict inside the resolver's worktree.
fn conflicted_harness() -> Harness {
    let harness = Harness::new();
    harness.vcs.script_conflicts(&["src/a.rs"]);
    let src = harness.dir.path().join("worktrees/resolve-9/src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("a.rs"), CONFLICTED).unwrap();
    harness
}

fn resolver(harness: &Harness, agent: &Arc<ReplyAgent>) -> AgentConflictResolver {
    AgentConflictResolver::new(
        agent.clone(),
        harness.vcs.clone(),
        harness.hosting.clone(),
        harness.dir.path().join("worktrees"),
        Duration::from_secs(5),
    )
    .with_retry(RetryPolicy::immediate(2))
}

// ========== Resolution Tests ==========

#[tokio::test]
async fn test_conflicts_resolved_committed_and_pushed() {
    let harness = conflicted_harness();
    let agent = Arc::new(ReplyAgent::new("```rust\nfn a() -> u8 { 1 }\n```"));

    let report = resolver(&harness, &agent).resolve(&artifact()).await.unwrap();

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.resolved_files, vec!["src/a.rs"]);
    let resolved =
        std::fs::read_to_string(harness.dir.path().join("worktrees/resolve-9/src/a.rs")).unwrap();
    assert_eq!(resolved, "fn a() -> u8 { 1 }\n");
    assert_eq!(
        *harness.vcs.commits.lock().unwrap(),
        vec!["[agent] fix: resolve merge conflicts with base (1 files)"]
    );
    assert_eq!(harness.vcs.pushes.load(Ordering::SeqCst), 1);
    assert_eq!(harness.vcs.released(), 1);
    assert!(agent.prompts()[0].contains("abc123 Rename config loader"));
    assert!(harness.hosting.comments.lock().unwrap()[0].1.contains("`src/a.rs`"));
}

#[tokio::test]
async fn test_missing_incoming_summary_does_not_block_resolution() {
    let harness = conflicted_harness();
    harness.vcs.fail_incoming();
    let agent = Arc::new(ReplyAgent::new("fn a() -> u8 { 1 }\n"));

    let report = resolver(&harness, &agent).resolve(&artifact()).await.unwrap();

    assert!(report.success);
    assert!(!agent.prompts()[0].contains("abc123"));
}

#[tokio::test]
async fn test_leftover_markers_fail_without_push() {
    let harness = conflicted_harness();
    let agent = Arc::new(ReplyAgent::new(CONFLICTED));

    let report = resolver(&harness, &agent).resolve(&artifact()).await.unwrap();

    assert!(!report.success);
    assert!(report
        .error
        .unwrap()
        .contains("Conflict markers remain in src/a.rs"));
    assert_eq!(harness.vcs.pushes.load(Ordering::SeqCst), 0);
    assert_eq!(harness.vcs.released(), 1);
}

#[tokio::test]
async fn test_clean_merge_needs_no_agent() {
    let harness = Harness::new();
    let agent = Arc::new(ReplyAgent::new("unused"));

    let report = resolver(&harness, &agent).resolve(&artifact()).await.unwrap();

    assert!(report.success);
    assert!(report.resolved_files.is_empty());
    assert!(agent.prompts().is_empty());
    assert!(harness.hosting.comments.lock().unwrap().is_empty());
}
