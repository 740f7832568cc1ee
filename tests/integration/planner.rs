//! Dry-run planning from plan files on disk.

use foreman::core::{load_plan, TaskId};
use foreman::orchestration::plan;
use foreman::Error;

const PLAN: &str = r#"
tasks:
  - id: schema
    title: Add schema
    files_touched: [src/schema.rs, ./src/lib.rs]
  - id: api
    title: Expose API
    files_touched: [src/lib.rs]
  - id: docs
    title: Document API
    depends_on: [api]
    priority: 2
"#;

fn write_plan(name: &str, content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    (dir, path)
}

#[test]
fn test_plan_file_to_waves() {
    let (_dir, path) = write_plan("plan.yaml", PLAN);
    let tasks = load_plan(&path).unwrap();
    let report = plan(&tasks);

    // `./src/lib.rs` normalizes onto the same lock as `src/lib.rs`.
    let order: Vec<Vec<&str>> = report
        .waves
        .iter()
        .map(|w| w.tasks.iter().map(TaskId::as_str).collect())
        .collect();
    assert_eq!(order, vec![vec!["schema"], vec!["api"], vec!["docs"]]);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].file, "src/lib.rs");
    assert!(report.is_schedulable());

    let text = report.render(&tasks, 2);
    assert!(text.contains("Wave 3 [priority 2]"));
    assert!(text.contains("[depends on: api]"));
}

#[test]
fn test_toml_plan_loads() {
    let (_dir, path) = write_plan(
        "plan.toml",
        "[[tasks]]\nid = \"a\"\ntitle = \"A\"\n\n[[tasks]]\nid = \"b\"\ntitle = \"B\"\ndepends_on = [\"a\"]\n",
    );
    let tasks = load_plan(&path).unwrap();
    assert_eq!(plan(&tasks).waves.len(), 2);
}

#[test]
fn test_unknown_dependency_rejected() {
    let (_dir, path) = write_plan(
        "plan.yaml",
        "tasks:\n  - id: a\n    title: A\n    depends_on: [ghost]\n",
    );
    let err = load_plan(&path).unwrap_err();
    assert!(matches!(err, Error::Plan(_)));
    assert!(err.to_string().contains("ghost"));
}
