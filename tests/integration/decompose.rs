//! Decomposing vague work items into sub-issues.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use foreman::core::WorkItem;
use foreman::orchestration::decompose::DECOMPOSED_LABEL;
use foreman::orchestration::Decomposer;

use crate::fixtures::{FakeHosting, ReplyAgent};

const SPLIT: &str = r#"{"tasks": [
  {"id": "api", "title": "Add endpoint", "description": "Expose search.",
   "files_touched": ["src/api.rs"], "depends_on": ["model"], "max_turns": 25},
  {"id": "model", "title": "Add model", "description": "Define the index.",
   "files_touched": ["src/model.rs"]}
]}"#;

fn decomposer(agent: &Arc<ReplyAgent>, hosting: &Arc<FakeHosting>) -> Decomposer {
    Decomposer::new(
        agent.clone(),
        hosting.clone(),
        PathBuf::from("."),
        "agent-ready",
        Duration::from_secs(5),
    )
}

fn item(number: u64, body: &str) -> WorkItem {
    WorkItem {
        number,
        title: format!("Issue {}", number),
        body: body.to_string(),
        labels: vec!["agent-ready".to_string()],
    }
}

fn detailed_body() -> String {
    format!(
        "{}\n\nFiles:\n- src/search.rs\n",
        "Search results are not ranked by relevance yet. ".repeat(3)
    )
}

// ========== Decomposition Tests ==========

#[tokio::test]
async fn test_vague_issue_split_into_sub_issues() {
    let agent = Arc::new(ReplyAgent::new(SPLIT));
    let hosting = Arc::new(FakeHosting::default());
    hosting.without_labels();

    let items = vec![item(5, "Add search"), item(6, &detailed_body())];
    let done = decomposer(&agent, &hosting).run_pass(&items).await;

    assert_eq!(done, vec![(5, vec![101, 102])]);
    assert_eq!(agent.prompts().len(), 1);
    assert!(agent.prompts()[0].contains("Issue #5: Issue 5"));

    let issues = hosting.issues.lock().unwrap();
    assert_eq!(issues[0].title, "Add model");
    assert_eq!(issues[1].title, "Add endpoint");
    assert!(issues[1].body.contains("Files:\n- src/api.rs"));
    assert!(issues[1].body.contains("Depends on: #101"));
    assert!(issues[1].body.contains("Max turns: 25"));
    assert!(issues.iter().all(|i| i.labels == vec!["agent-ready"]));

    assert_eq!(*hosting.labels_created.lock().unwrap(), vec![DECOMPOSED_LABEL]);
    let comments = hosting.issue_comments.lock().unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].0, 5);
    assert!(comments[0].1.contains("- #101\n- #102"));
    assert_eq!(
        *hosting.relabels.lock().unwrap(),
        vec![(5, "agent-ready".to_string(), DECOMPOSED_LABEL.to_string())]
    );
}

#[tokio::test]
async fn test_failed_sub_issue_is_skipped() {
    let agent = Arc::new(ReplyAgent::new(SPLIT));
    let hosting = Arc::new(FakeHosting::default());
    hosting.reject_issue("Add model");

    let children = decomposer(&agent, &hosting)
        .decompose(&item(5, "Add search"))
        .await
        .unwrap();

    assert_eq!(children, vec![101]);
    let issues = hosting.issues.lock().unwrap();
    assert_eq!(issues[0].title, "Add endpoint");
    assert!(!issues[0].body.contains("Depends on"));
    assert!(hosting.labels_created.lock().unwrap().is_empty());
    assert_eq!(hosting.relabels.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_parent_untouched_when_no_sub_issue_opens() {
    let agent = Arc::new(ReplyAgent::new(SPLIT));
    let hosting = Arc::new(FakeHosting::default());
    hosting.reject_issue("Add model");
    hosting.reject_issue("Add endpoint");

    let result = decomposer(&agent, &hosting).decompose(&item(5, "Add search")).await;

    assert!(result.is_err());
    assert!(hosting.issue_comments.lock().unwrap().is_empty());
    assert!(hosting.relabels.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unreadable_reply_leaves_parent() {
    let agent = Arc::new(ReplyAgent::new("I could not work out a split."));
    let hosting = Arc::new(FakeHosting::default());

    let done = decomposer(&agent, &hosting)
        .run_pass(&[item(5, "Add search")])
        .await;

    assert!(done.is_empty());
    assert!(hosting.issues.lock().unwrap().is_empty());
    assert!(hosting.relabels.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_detailed_issues_need_no_agent() {
    let agent = Arc::new(ReplyAgent::new(SPLIT));
    let hosting = Arc::new(FakeHosting::default());

    let done = decomposer(&agent, &hosting)
        .run_pass(&[item(6, &detailed_body())])
        .await;

    assert!(done.is_empty());
    assert!(agent.prompts().is_empty());
}
