//! Remediation pipeline runs for a single change request.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use foreman::core::{Artifact, RemediationOutcome, TaskId};
use foreman::orchestration::{EventSink, Pipeline, SchedulerEvent};
use foreman::ports::{Mergeability, Review, Severity, Verdict};

use crate::fixtures::{errors, finding, FakeResolver, Harness};

fn artifact() -> Artifact {
    Artifact::from_url("https://github.com/o/r/pull/9", "agent/t-task").unwrap()
}

async fn remediate(harness: &Harness) -> RemediationOutcome {
    Pipeline::new(
        TaskId::from("t"),
        artifact(),
        &harness.collaborators(),
        Arc::new(harness.pipeline_settings()),
        EventSink::none(),
    )
    .run()
    .await
}

// ========== Review Loop Tests ==========

#[tokio::test]
async fn test_clean_review_merges() {
    let harness = Harness::new();
    assert_eq!(remediate(&harness).await, RemediationOutcome::Landed);
    assert_eq!(harness.hosting.merged(), vec![9]);
    assert_eq!(harness.fixer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fix_then_approve() {
    let harness = Harness::new();
    harness.evaluator.script([errors(2)]);
    assert_eq!(remediate(&harness).await, RemediationOutcome::Landed);
    assert_eq!(harness.fixer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.evaluator.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stalled_errors_exhaust_budget() {
    let mut harness = Harness::new();
    harness.max_fix_attempts = 1;
    harness.evaluator.always(errors(3));
    let RemediationOutcome::Failed { error } = remediate(&harness).await else {
        panic!("expected failure");
    };
    assert!(error.contains("after 1 fix attempt(s)"));
    assert!(error.contains("3 error finding(s) remain"));
    assert!(harness.hosting.merged().is_empty());
}

#[tokio::test]
async fn test_progress_capped_by_buffer() {
    let mut harness = Harness::new();
    harness.max_fix_attempts = 1;
    harness.extra_fix_buffer = 1;
    harness
        .evaluator
        .script([errors(9), errors(8), errors(7), errors(6)]);
    let RemediationOutcome::Failed { error } = remediate(&harness).await else {
        panic!("expected failure");
    };
    assert!(error.contains("after 2 fix attempt(s)"), "{}", error);
    assert_eq!(harness.fixer.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_warnings_alone_approve_and_file_followups() {
    let harness = Harness::new();
    harness.evaluator.script([Review {
        claimed: Verdict::RequestChanges,
        summary: "Minor issues".to_string(),
        findings: vec![
            finding(Severity::Warning, "Consider caching the parsed config. It is reread often."),
            finding(Severity::Suggestion, "short"),
        ],
    }]);
    assert_eq!(remediate(&harness).await, RemediationOutcome::Landed);
    assert_eq!(harness.fixer.calls.load(Ordering::SeqCst), 0);

    let issues = harness.hosting.issues.lock().unwrap().clone();
    assert_eq!(issues.len(), 1);
    assert_eq!(
        issues[0].title,
        "[Review Follow-up] src/lib.rs: Consider caching the parsed config"
    );
    assert!(issues[0].labels.contains(&"review-followup".to_string()));
    let comments = harness.hosting.comments.lock().unwrap().clone();
    assert!(comments
        .iter()
        .any(|(n, body)| *n == 9 && body.contains("Review Follow-up Issues Created")));
}

// ========== Mergeability Tests ==========

#[tokio::test]
async fn test_conflicts_resolved_then_merged() {
    let harness = Harness::new();
    harness
        .hosting
        .script_mergeability([Mergeability::Conflicting, Mergeability::Mergeable]);
    assert_eq!(remediate(&harness).await, RemediationOutcome::Landed);
    assert_eq!(harness.resolver.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.hosting.merged(), vec![9]);
}

#[tokio::test]
async fn test_persistent_unknown_treated_as_conflict() {
    let harness = Harness::new();
    // One initial query plus three re-checks, all unknown.
    harness
        .hosting
        .script_mergeability([Mergeability::Unknown; 4]);
    assert_eq!(remediate(&harness).await, RemediationOutcome::Landed);
    assert_eq!(harness.resolver.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_still_conflicting_after_resolution_fails() {
    let harness = Harness::new();
    harness
        .hosting
        .script_mergeability(std::iter::repeat(Mergeability::Conflicting).take(10));
    let RemediationOutcome::Failed { error } = remediate(&harness).await else {
        panic!("expected failure");
    };
    assert!(error.contains("not mergeable after conflict resolution"));
    assert!(harness.hosting.merged().is_empty());
}

#[tokio::test]
async fn test_failed_resolution_fails_pipeline() {
    let mut harness = Harness::new();
    harness.resolver = Arc::new(FakeResolver::new(false));
    harness
        .hosting
        .script_mergeability([Mergeability::Conflicting]);
    let RemediationOutcome::Failed { error } = remediate(&harness).await else {
        panic!("expected failure");
    };
    assert!(error.contains("Conflict resolution failed"));
    assert!(error.contains("markers remain"));
}

// ========== Cancellation Tests ==========

#[tokio::test]
async fn test_cancelled_pipeline_stops_before_next_stage() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = Pipeline::new(
        TaskId::from("t"),
        artifact(),
        &harness.collaborators(),
        Arc::new(harness.pipeline_settings()),
        EventSink::none(),
    )
    .with_cancellation(cancel)
    .run()
    .await;

    assert_eq!(outcome, RemediationOutcome::failed("Cancelled"));
    assert_eq!(harness.evaluator.calls.load(Ordering::SeqCst), 0);
    assert!(harness.hosting.merged().is_empty());
}

// ========== Event Tests ==========

#[tokio::test]
async fn test_events_follow_stages() {
    let harness = Harness::new();
    harness.evaluator.script([errors(1)]);
    let (tx, mut rx) = mpsc::channel(32);
    let outcome = Pipeline::new(
        TaskId::from("t"),
        artifact(),
        &harness.collaborators(),
        Arc::new(harness.pipeline_settings()),
        EventSink::new(tx),
    )
    .run()
    .await;
    assert_eq!(outcome, RemediationOutcome::Landed);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events[0], SchedulerEvent::ReviewStarted { round: 1, .. }));
    assert!(matches!(
        events[1],
        SchedulerEvent::ReviewFinished {
            verdict: Verdict::RequestChanges,
            errors: 1,
            ..
        }
    ));
    assert!(matches!(events[2], SchedulerEvent::FixStarted { attempt: 1, .. }));
    assert!(matches!(events.last(), Some(SchedulerEvent::Merged { .. })));
}
