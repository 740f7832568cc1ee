//! Single task attempts against scripted version control and hosting.

use std::sync::atomic::Ordering;

use foreman::core::Task;

use crate::fixtures::Harness;

fn scoped_task() -> Task {
    Task::new("t1", "Add A").with_files(["src/a.rs"])
}

/// Harness whose workspaces change only the scoped task's file.
fn harness() -> Harness {
    let harness = Harness::new();
    harness.vcs.script_changes(&["src/a.rs"]);
    harness
}

// ========== Allowlist Tests ==========

#[tokio::test]
async fn test_unauthorized_files_reverted_and_committed() {
    let harness = harness();
    harness.vcs.script_changes(&["src/a.rs", "README.md"]);

    let result = harness.worker(scoped_task()).run().await;

    assert!(result.is_success(), "{:?}", result.error());
    assert_eq!(result.files_changed, vec!["src/a.rs"]);
    assert_eq!(*harness.vcs.reverted.lock().unwrap(), vec!["README.md"]);
    assert_eq!(
        *harness.vcs.commits.lock().unwrap(),
        vec!["[agent] chore: revert unauthorized changes for t1"]
    );
    assert_eq!(harness.vcs.pushes.load(Ordering::SeqCst), 1);
    assert_eq!(harness.hosting.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_nothing_left_after_revert_fails() {
    let harness = harness();
    harness.vcs.script_changes(&["README.md", "docs/guide.md"]);

    let result = harness.worker(scoped_task()).run().await;

    assert_eq!(
        result.error(),
        Some("No authorized changes left after reverting README.md, docs/guide.md")
    );
    assert_eq!(harness.vcs.pushes.load(Ordering::SeqCst), 0);
    assert!(harness.hosting.created.lock().unwrap().is_empty());
    assert_eq!(harness.vcs.released(), 1);
}

#[tokio::test]
async fn test_unscoped_task_keeps_every_change() {
    let harness = harness();
    harness.vcs.script_changes(&["src/a.rs", "README.md"]);

    let result = harness.worker(Task::new("t2", "Anything")).run().await;

    assert!(result.is_success());
    assert_eq!(result.files_changed, vec!["src/a.rs", "README.md"]);
    assert!(harness.vcs.reverted.lock().unwrap().is_empty());
}

// ========== Failure Branch Tests ==========

#[tokio::test]
async fn test_no_commits_ahead_fails() {
    let harness = harness();
    harness.vcs.report_no_commits();

    let result = harness.worker(scoped_task()).run().await;

    assert!(!result.is_success());
    assert!(result.error().unwrap().contains("No commits ahead of main"));
    assert_eq!(harness.agent.runs_of("t1").len(), 1);
    assert_eq!(harness.vcs.pushes.load(Ordering::SeqCst), 0);
    assert_eq!(harness.vcs.released(), 1);
}

#[tokio::test]
async fn test_workspace_setup_failure_skips_agent() {
    let harness = harness();
    harness.vcs.fail_prepare();

    let result = harness.worker(scoped_task()).run().await;

    assert!(result.error().unwrap().contains("Workspace setup failed"));
    assert!(harness.agent.runs_of("t1").is_empty());
    assert!(result.output.is_none());
    assert_eq!(harness.vcs.released(), 1);
    assert_eq!(harness.attempt_logs().len(), 1);
}

#[tokio::test]
async fn test_push_gives_up_after_bounded_retries() {
    let harness = harness();
    harness.vcs.fail_pushes(5);

    let result = harness.worker(scoped_task()).run().await;

    assert!(result.error().unwrap().contains("git push failed"));
    assert_eq!(harness.vcs.pushes.load(Ordering::SeqCst), 2);
    assert!(harness.hosting.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_push_recovers_from_transient_failure() {
    let harness = harness();
    harness.vcs.fail_pushes(1);

    let result = harness.worker(scoped_task()).run().await;

    assert!(result.is_success());
    assert_eq!(harness.vcs.pushes.load(Ordering::SeqCst), 2);
}

// ========== Change Request Tests ==========

#[tokio::test]
async fn test_change_request_falls_back_without_missing_label() {
    let harness = harness();
    harness.hosting.without_labels();

    let result = harness.worker(scoped_task()).run().await;

    let artifact = result.artifact().expect("change request created");
    assert_eq!(artifact.number, 1);
    let created = harness.hosting.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].label, None);
    assert_eq!(created[0].title, "[Agent] Add A");
}

#[tokio::test]
async fn test_change_request_keeps_existing_label() {
    let harness = harness();

    let result = harness.worker(scoped_task()).run().await;

    assert!(result.is_success());
    let created = harness.hosting.created.lock().unwrap();
    assert_eq!(created[0].label.as_deref(), Some("agent-created"));
}
