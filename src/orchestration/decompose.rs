//! Breaking vague work items into smaller, independently runnable ones.
//!
//! A work item is vague when its body is short or names no files. The
//! decomposer asks the agent for a JSON task list, opens one sub-issue per
//! entry (dependencies first, so `Depends on:` can cite real numbers), then
//! comments on the parent and swaps its ready label for
//! [`DECOMPOSED_LABEL`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::core::issue::has_files_section;
use crate::core::{DependencyGraph, Task, WorkItem};
use crate::ports::{AgentRequest, CodeAgent, Hosting, NewIssue};
use crate::util::truncate;
use crate::{flog, flog_debug, flog_error, flog_warn, Error, Result};

use super::review::parse_json_reply;

/// Label placed on a parent once its sub-issues exist.
pub const DECOMPOSED_LABEL: &str = "agent-decomposed";
const DECOMPOSED_COLOR: &str = "8B5CF6";
const DECOMPOSED_DESCRIPTION: &str = "Broken into sub-tasks";

/// Bodies shorter than this are treated as underspecified.
const MIN_BODY_CHARS: usize = 100;

const DEFAULT_SUBTASK_TURNS: u32 = 30;

const DECOMPOSER_PREAMBLE: &str = "\
You are a technical project manager splitting a software issue into sub-tasks \
that autonomous coding agents will implement in parallel.

Rules:
- Each sub-task must be independently implementable and testable.
- Minimise overlap in files_touched between sub-tasks.
- Use depends_on only when one sub-task truly needs another's output.
- Include test files in files_touched alongside the code they cover.
- Set max_turns by size: 15-25 for small edits, 30-50 for a new module, \
55-80 for cross-cutting changes.

Respond with ONLY a JSON object of this shape:
{
  \"tasks\": [
    {
      \"id\": \"short-slug\",
      \"title\": \"Imperative summary\",
      \"description\": \"What to build and how to verify it.\",
      \"files_touched\": [\"src/example.rs\"],
      \"depends_on\": [\"other-slug\"],
      \"priority\": 1,
      \"max_turns\": 30
    }
  ]
}";

/// Whether a work item body is too thin to hand straight to a worker.
pub fn is_vague(body: &str) -> bool {
    body.trim().chars().count() < MIN_BODY_CHARS || !has_files_section(body)
}

/// One entry of the agent's decomposition.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubTask {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
}

fn default_priority() -> u32 {
    1
}

fn default_max_turns() -> u32 {
    DEFAULT_SUBTASK_TURNS
}

#[derive(Debug, Deserialize)]
struct Decomposition {
    tasks: Vec<SubTask>,
}

/// Parse the agent's reply into sub-tasks.
///
/// Missing ids become `task-N` (1-based position); a repeated id gets its
/// position appended so every sub-task stays addressable.
pub fn parse_subtasks(text: &str) -> Result<Vec<SubTask>> {
    let raw: Decomposition = parse_json_reply(text)
        .map_err(|e| Error::Execution(format!("Unreadable decomposition: {}", e)))?;
    let mut seen = HashSet::new();
    Ok(raw
        .tasks
        .into_iter()
        .enumerate()
        .map(|(i, mut sub)| {
            let id = sub.id.trim();
            sub.id = if id.is_empty() {
                format!("task-{}", i + 1)
            } else {
                id.to_string()
            };
            if !seen.insert(sub.id.clone()) {
                sub.id = format!("{}-{}", sub.id, i + 1);
                seen.insert(sub.id.clone());
            }
            sub
        })
        .collect())
}

/// Positions of `subtasks` in creation order: every dependency before the
/// sub-tasks that cite it. Unknown dependency ids are ignored.
pub fn creation_order(subtasks: &[SubTask]) -> Result<Vec<usize>> {
    let tasks: Vec<Task> = subtasks
        .iter()
        .map(|sub| {
            Task::new(sub.id.as_str(), sub.title.as_str())
                .with_deps(sub.depends_on.iter().map(String::as_str))
        })
        .collect();
    let position: HashMap<&str, usize> = subtasks
        .iter()
        .enumerate()
        .map(|(i, sub)| (sub.id.as_str(), i))
        .collect();
    Ok(DependencyGraph::from_tasks(&tasks)
        .topological_order()?
        .iter()
        .filter_map(|id| position.get(id.as_str()).copied())
        .collect())
}

/// Body of a sub-issue, in the section format work items are parsed from.
///
/// Dependencies are cited by the issue numbers in `created`; ones not yet
/// created are dropped.
pub fn sub_issue_body(sub: &SubTask, created: &HashMap<String, u64>) -> String {
    let mut body = sub.description.trim().to_string();
    if !sub.files_touched.is_empty() {
        body.push_str("\n\nFiles:\n");
        let list: Vec<String> = sub.files_touched.iter().map(|f| format!("- {}", f)).collect();
        body.push_str(&list.join("\n"));
    }
    let deps: Vec<String> = sub
        .depends_on
        .iter()
        .filter_map(|d| created.get(d))
        .map(|n| format!("#{}", n))
        .collect();
    if !deps.is_empty() {
        body.push_str(&format!("\n\nDepends on: {}", deps.join(", ")));
    }
    body.push_str(&format!("\n\nMax turns: {}", sub.max_turns));
    body
}

/// Trailing issue number of an issue URL.
pub fn issue_number_from_url(url: &str) -> Option<u64> {
    url.trim().trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

fn parent_comment(children: &[u64], ready_label: &str) -> String {
    let list: Vec<String> = children.iter().map(|n| format!("- #{}", n)).collect();
    format!(
        "This issue has been decomposed into {} sub-tasks:\n\n{}\n\n\
         Each sub-task has been created as a separate issue with the `{}` label.",
        children.len(),
        list.join("\n"),
        ready_label
    )
}

fn decomposer_prompt(item: &WorkItem) -> String {
    format!(
        "{}\n\nDecompose the following issue into independent, parallelisable sub-tasks.\n\n\
         Issue #{}: {}\n\n{}",
        DECOMPOSER_PREAMBLE, item.number, item.title, item.body
    )
}

/// Splits vague work items into sub-issues through the agent and the
/// hosting service.
pub struct Decomposer {
    agent: Arc<dyn CodeAgent>,
    hosting: Arc<dyn Hosting>,
    repo_path: PathBuf,
    ready_label: String,
    model: String,
    timeout: Duration,
}

impl Decomposer {
    pub fn new(
        agent: Arc<dyn CodeAgent>,
        hosting: Arc<dyn Hosting>,
        repo_path: PathBuf,
        ready_label: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            agent,
            hosting,
            repo_path,
            ready_label: ready_label.into(),
            model: "opus".to_string(),
            timeout,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn ensure_label(&self) {
        match self.hosting.label_exists(DECOMPOSED_LABEL).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self
                    .hosting
                    .create_label(DECOMPOSED_LABEL, DECOMPOSED_COLOR, DECOMPOSED_DESCRIPTION)
                    .await
                {
                    flog_warn!("Could not create label {}: {}", DECOMPOSED_LABEL, e);
                }
            }
            Err(e) => flog_warn!("Could not check label {}: {}", DECOMPOSED_LABEL, e),
        }
    }

    /// Decompose one work item. Returns the numbers of the sub-issues
    /// opened, in creation order.
    ///
    /// # Errors
    ///
    /// Fails when the agent run or its reply is unusable, or when not a
    /// single sub-issue could be opened. The parent is left untouched then.
    pub async fn decompose(&self, item: &WorkItem) -> Result<Vec<u64>> {
        flog!("Decomposing #{}: {}", item.number, item.title);
        let run = self
            .agent
            .invoke(AgentRequest {
                prompt: decomposer_prompt(item),
                cwd: self.repo_path.clone(),
                model: self.model.clone(),
                max_turns: 10,
                allowed_tools: vec!["Read".into(), "Glob".into(), "Grep".into()],
                timeout: self.timeout,
            })
            .await?;
        if !run.is_success() {
            return Err(Error::Execution(format!(
                "Decomposer exited with code {}: {}",
                run.exit_code,
                truncate(run.stderr.trim(), 300)
            )));
        }

        let subtasks = parse_subtasks(&run.output)?;
        if subtasks.is_empty() {
            return Err(Error::Execution(format!(
                "Decomposition of #{} produced no sub-tasks",
                item.number
            )));
        }
        let order = creation_order(&subtasks)?;

        self.ensure_label().await;

        let mut created: HashMap<String, u64> = HashMap::new();
        let mut children = Vec::new();
        for position in order {
            let sub = &subtasks[position];
            let issue = NewIssue {
                title: sub.title.clone(),
                body: sub_issue_body(sub, &created),
                labels: vec![self.ready_label.clone()],
            };
            match self.hosting.create_issue(&issue).await {
                Ok(url) => match issue_number_from_url(&url) {
                    Some(number) => {
                        flog_debug!("Sub-task {} opened as #{}", sub.id, number);
                        created.insert(sub.id.clone(), number);
                        children.push(number);
                    }
                    None => flog_warn!("Unrecognised issue reference for {}: {}", sub.id, url),
                },
                Err(e) => flog_error!("Failed to open sub-task {} of #{}: {}", sub.id, item.number, e),
            }
        }

        if children.is_empty() {
            return Err(Error::Execution(format!(
                "No sub-issues could be opened for #{}",
                item.number
            )));
        }

        self.hosting
            .comment_issue(item.number, &parent_comment(&children, &self.ready_label))
            .await?;
        self.hosting
            .relabel_issue(item.number, &self.ready_label, DECOMPOSED_LABEL)
            .await?;
        flog!("Decomposed #{} into {} sub-tasks", item.number, children.len());
        Ok(children)
    }

    /// Decompose every vague item in `items`. Per-item failures are logged
    /// and skipped. Returns `(parent, children)` for each success.
    pub async fn run_pass(&self, items: &[WorkItem]) -> Vec<(u64, Vec<u64>)> {
        let vague: Vec<&WorkItem> = items.iter().filter(|i| is_vague(&i.body)).collect();
        if vague.is_empty() {
            flog!("No vague work items to decompose");
            return Vec::new();
        }
        let mut decomposed = Vec::new();
        for item in vague {
            match self.decompose(item).await {
                Ok(children) => decomposed.push((item.number, children)),
                Err(e) => flog_error!("Could not decompose #{}: {}", item.number, e),
            }
        }
        decomposed
    }
}
