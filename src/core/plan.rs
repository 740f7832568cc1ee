//! Plan file loading.
//!
//! A plan is a YAML (or TOML) document with a top-level `tasks` list.
//! Loading validates id uniqueness and that every dependency names a task in
//! the same batch.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::task::{normalize_path, Task};
use crate::{flog, Error, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct PlanFile {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Load and validate a plan file.
///
/// The format is chosen by extension: `.toml` is TOML, anything else is
/// parsed as YAML.
///
/// # Errors
///
/// Returns [`Error::Plan`] if the file has no tasks, contains a duplicate id,
/// or a dependency references an id that is not in the plan.
pub fn load_plan(path: &Path) -> Result<Vec<Task>> {
    let raw = std::fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    let tasks = if is_toml {
        parse_toml(&raw)
    } else {
        parse_yaml(&raw)
    }
    .map_err(|e| match e {
        Error::Plan(msg) => Error::Plan(format!("{} ({})", msg, path.display())),
        other => other,
    })?;
    flog!("Loaded {} task(s) from {}", tasks.len(), path.display());
    Ok(tasks)
}

pub fn parse_yaml(raw: &str) -> Result<Vec<Task>> {
    let plan: Option<PlanFile> = serde_yaml::from_str(raw)?;
    finish(plan.unwrap_or_default())
}

pub fn parse_toml(raw: &str) -> Result<Vec<Task>> {
    let plan: PlanFile = toml::from_str(raw)?;
    finish(plan)
}

fn finish(plan: PlanFile) -> Result<Vec<Task>> {
    if plan.tasks.is_empty() {
        return Err(Error::Plan("No 'tasks' key found".to_string()));
    }
    let tasks: Vec<Task> = plan
        .tasks
        .into_iter()
        .map(|mut task| {
            task.files_touched = task
                .files_touched
                .iter()
                .map(|f| normalize_path(f))
                .collect();
            task
        })
        .collect();
    validate(&tasks)?;
    Ok(tasks)
}

/// Check id uniqueness and dependency references.
pub fn validate(tasks: &[Task]) -> Result<()> {
    let mut seen = HashSet::new();
    for task in tasks {
        if task.id.as_str().trim().is_empty() {
            return Err(Error::Plan("Task with empty ID".to_string()));
        }
        if !seen.insert(&task.id) {
            return Err(Error::Plan(format!("Duplicate task ID: {}", task.id)));
        }
    }
    for task in tasks {
        for dep in &task.depends_on {
            if !seen.contains(dep) {
                return Err(Error::Plan(format!(
                    "Task '{}' depends on '{}' which does not exist",
                    task.id, dep
                )));
            }
        }
    }
    Ok(())
}
