//! End-to-end scheduler runs against in-memory collaborators.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use foreman::core::{Task, TaskId};
use foreman::orchestration::{HaltReason, RunSnapshot};

use crate::fixtures::{errors, FakeAgent, Harness};

fn ids(list: &[TaskId]) -> Vec<&str> {
    list.iter().map(TaskId::as_str).collect()
}

// ========== Happy Path Tests ==========

#[tokio::test]
async fn test_approved_task_is_merged_and_completed() {
    let harness = Harness::new();
    let report = harness.run(vec![Task::new("a", "Add A")]).await;

    assert_eq!(report.halt, HaltReason::AllSettled);
    assert_eq!(ids(&report.completed), vec!["a"]);
    assert!(report.failed.is_empty());
    assert!(report.is_success());
    assert_eq!(harness.hosting.merged(), vec![1]);
    assert_eq!(harness.vcs.syncs.load(Ordering::SeqCst), 1);
    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(report.artifacts[0].1.url, "https://github.com/o/r/pull/1");

    let created = harness.hosting.created.lock().unwrap().clone();
    assert_eq!(created[0].head, "agent/a-add-a");
    assert_eq!(created[0].label.as_deref(), Some("agent-created"));
}

#[tokio::test]
async fn test_status_file_written_with_halt() {
    let harness = Harness::new();
    harness
        .run(vec![Task::new("a", "Add A"), Task::new("b", "Add B")])
        .await;

    let snapshot = RunSnapshot::load(&harness.status_path()).unwrap();
    assert_eq!(snapshot.halt, Some(HaltReason::AllSettled));
    assert_eq!(snapshot.tasks.total, 2);
    assert_eq!(snapshot.tasks.completed, 2);
    assert_eq!(snapshot.prs.len(), 2);
    assert!(snapshot.workers.is_empty());
}

// ========== Remediation Tests ==========

#[tokio::test]
async fn test_unfixable_errors_fail_task_after_budget() {
    let harness = Harness::new();
    harness.evaluator.always(errors(1));
    let report = harness.run(vec![Task::new("issue-5", "Broken")]).await;

    assert!(report.completed.is_empty());
    assert_eq!(report.failed.len(), 1);
    let (id, error) = &report.failed[0];
    assert_eq!(id.as_str(), "issue-5");
    assert!(error.contains("2 fix attempt(s)"), "unexpected error: {}", error);
    assert_eq!(harness.fixer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.evaluator.calls.load(Ordering::SeqCst), 3);
    assert!(harness.hosting.merged().is_empty());

    let failed = harness.source.failed.lock().unwrap().clone();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0.as_str(), "issue-5");
}

#[tokio::test]
async fn test_progress_earns_extra_fix_rounds() {
    let harness = Harness::new();
    harness
        .evaluator
        .script([errors(5), errors(4), errors(3), errors(2)]);
    let report = harness.run(vec![Task::new("a", "Add A")]).await;

    assert_eq!(ids(&report.completed), vec!["a"]);
    assert_eq!(harness.fixer.calls.load(Ordering::SeqCst), 4);
}

// ========== Isolation Tests ==========

#[tokio::test]
async fn test_tasks_sharing_a_file_never_run_together() {
    let mut harness = Harness::with_agent(FakeAgent::with_delay(Duration::from_millis(50)));
    harness.max_workers = 3;
    let tasks = vec![
        Task::new("a", "First").with_files(["src/x.rs"]),
        Task::new("b", "Second").with_files(["src/x.rs"]),
        Task::new("c", "Other").with_files(["src/y.rs"]),
    ];
    let report = harness.run(tasks).await;
    assert_eq!(report.completed.len(), 3);

    let a = harness.agent.runs_of("a").remove(0);
    let b = harness.agent.runs_of("b").remove(0);
    let c = harness.agent.runs_of("c").remove(0);
    assert!(
        a.finished <= b.started || b.finished <= a.started,
        "a and b overlapped"
    );
    // Disjoint files do run concurrently.
    assert!(c.started < a.finished && a.started < c.finished);
}

#[tokio::test]
async fn test_concurrency_cap_respected() {
    let mut harness = Harness::with_agent(FakeAgent::with_delay(Duration::from_millis(30)));
    harness.max_workers = 2;
    let tasks: Vec<Task> = (0..5)
        .map(|i| Task::new(format!("t{}", i), format!("Task {}", i)))
        .collect();
    let report = harness.run(tasks).await;
    assert_eq!(report.completed.len(), 5);

    let runs = harness.agent.invocations.lock().unwrap().clone();
    for run in &runs {
        let concurrent = runs
            .iter()
            .filter(|other| other.started < run.finished && run.started < other.finished)
            .count();
        assert!(concurrent <= 2, "{} executions overlapped", concurrent);
    }
}

// ========== Retry Tests ==========

#[tokio::test]
async fn test_retry_uses_fresh_branch_and_cleans_old_one() {
    let harness = Harness::new();
    harness.agent.fail("a", 1);
    let report = harness.run(vec![Task::new("a", "Add A")]).await;

    assert_eq!(ids(&report.completed), vec!["a"]);
    let prepared = harness.vcs.prepared.lock().unwrap().clone();
    assert_eq!(prepared, vec!["agent/a-add-a", "agent/a-add-a-retry-1"]);
    let deleted = harness.vcs.deleted.lock().unwrap().clone();
    assert_eq!(deleted, vec!["agent/a-add-a"]);

    assert_eq!(report.snapshot.retries.get("a"), Some(&1));
    let timing = &report.snapshot.task_timing["a"];
    assert_eq!(timing.cost_usd, Some(0.5));
    assert_eq!(timing.num_turns, Some(6));
}

#[tokio::test]
async fn test_failed_dependency_deadlocks_dependents() {
    let mut harness = Harness::new();
    harness.max_retries = 1;
    harness.agent.fail("a", 10);
    let tasks = vec![
        Task::new("a", "Base"),
        Task::new("b", "Needs base").with_deps(["a"]),
    ];
    let report = harness.run(tasks).await;

    assert_eq!(report.halt, HaltReason::Deadlock);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].1.contains("Agent exited with code 1"));
    assert_eq!(ids(&report.unsettled), vec!["b"]);
    assert!(!report.is_success());
    assert_eq!(harness.agent.runs_of("a").len(), 2);
    assert!(harness.agent.runs_of("b").is_empty());
}

// ========== Tier Tests ==========

#[tokio::test]
async fn test_tiers_run_in_order() {
    let harness = Harness::with_agent(FakeAgent::with_delay(Duration::from_millis(20)));
    let tasks = vec![
        Task::new("late", "Late").with_priority(2),
        Task::new("early", "Early").with_priority(1),
    ];
    let report = harness.run(tasks).await;
    assert_eq!(report.completed.len(), 2);

    let early = harness.agent.runs_of("early").remove(0);
    let late = harness.agent.runs_of("late").remove(0);
    assert!(early.finished <= late.started);
}

#[tokio::test]
async fn test_max_priority_stops_before_later_tier() {
    let mut harness = Harness::new();
    harness.max_priority = Some(1);
    let tasks = vec![
        Task::new("a", "First").with_priority(1),
        Task::new("b", "Second").with_priority(2),
    ];
    let report = harness.run(tasks).await;

    assert_eq!(report.halt, HaltReason::MaxPriorityReached);
    assert_eq!(ids(&report.completed), vec!["a"]);
    assert_eq!(ids(&report.unsettled), vec!["b"]);
    assert!(harness.agent.runs_of("b").is_empty());
    assert!(report.is_success());
}

// ========== Work Item Tests ==========

#[tokio::test]
async fn test_issue_tasks_reported_to_source() {
    let mut harness = Harness::new();
    harness.max_retries = 0;
    harness.agent.fail("issue-2", 1);
    let tasks = vec![
        Task::new("issue-1", "Works").with_files(["src/a.rs"]),
        Task::new("issue-2", "Breaks").with_files(["src/b.rs"]),
    ];
    let report = harness.run(tasks).await;
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.failed.len(), 1);

    let completed = harness.source.completed.lock().unwrap().clone();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].0.as_str(), "issue-1");
    assert!(completed[0].1.starts_with("https://github.com/o/r/pull/"));

    let failed = harness.source.failed.lock().unwrap().clone();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0.as_str(), "issue-2");
}

// ========== Cancellation Tests ==========

#[tokio::test]
async fn test_cancellation_halts_run() {
    let harness = Harness::with_agent(FakeAgent::with_delay(Duration::from_secs(10)));
    let cancel = CancellationToken::new();
    let scheduler = harness
        .scheduler(vec![Task::new("a", "Slow")])
        .with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
        .await
        .expect("cancellation is prompt")
        .unwrap();
    assert_eq!(report.halt, HaltReason::Cancelled);
    assert!(report.completed.is_empty());
    assert_eq!(ids(&report.unsettled), vec!["a"]);
}

#[tokio::test]
async fn test_cancellation_releases_workspace_and_writes_log() {
    let harness = Harness::with_agent(FakeAgent::with_delay(Duration::from_millis(300)));
    let cancel = CancellationToken::new();
    let scheduler = harness
        .scheduler(vec![Task::new("a", "Slow")])
        .with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
        .await
        .expect("cancellation is prompt")
        .unwrap();
    assert_eq!(report.halt, HaltReason::Cancelled);
    assert_eq!(ids(&report.unsettled), vec!["a"]);

    assert_eq!(harness.vcs.prepared.lock().unwrap().len(), 1);
    assert_eq!(harness.vcs.released(), 1);
    let logs = harness.attempt_logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].contains("task_id: a"));
    assert!(logs[0].contains("error: Cancelled"));
    // The agent call was abandoned, not waited out.
    assert!(harness.agent.runs_of("a").is_empty());
}
