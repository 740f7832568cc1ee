//! Optional architect pass that writes an implementation plan for a task
//! before a worker picks it up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use git2::Repository;

use crate::core::Task;
use crate::ports::{AgentRequest, CodeAgent, Enricher};
use crate::util::{blocking, truncate};
use crate::{flog, flog_debug, flog_warn, Result};

/// Files larger than this are left out of the architect's context.
const MAX_FILE_BYTES: u64 = 50 * 1024;

/// Repository guidance file included when present.
const GUIDANCE_FILE: &str = "CLAUDE.md";

const ARCHITECT_PREAMBLE: &str = "\
You are a senior software architect designing a detailed implementation plan \
for an autonomous coding agent.

Analyze the task, the repository structure and the relevant files. Then produce \
an implementation plan covering:

1. **Summary**: what needs to change and why
2. **Signatures**: exact signatures for all new or modified functions
3. **Error handling**: what can fail and how to handle it
4. **Test cases**: specific test names and what each verifies
5. **Acceptance criteria**: how to verify the implementation
6. **Patterns to follow**: conventions observed in the codebase
7. **Risks**: edge cases and breaking changes

Be precise and actionable. The worker agent will implement this plan without \
asking clarifying questions.";

/// Paths tracked in the repository index.
fn tracked_files(repo_path: &Path) -> Result<Vec<String>> {
    let repo = Repository::open(repo_path)?;
    let index = repo.index()?;
    Ok(index
        .iter()
        .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
        .collect())
}

fn read_small(path: &Path) -> Option<String> {
    let meta = std::fs::metadata(path).ok()?;
    if meta.len() > MAX_FILE_BYTES {
        flog_debug!("Skipping {} ({} bytes)", path.display(), meta.len());
        return None;
    }
    std::fs::read_to_string(path).ok()
}

fn file_context(repo_path: &Path, task: &Task) -> String {
    let mut sections = Vec::new();
    if let Some(content) = read_small(&repo_path.join(GUIDANCE_FILE)) {
        sections.push(format!("## {}\n\n```\n{}\n```", GUIDANCE_FILE, content));
    }
    for file in &task.files_touched {
        if let Some(content) = read_small(&repo_path.join(file)) {
            sections.push(format!("## {}\n\n```\n{}\n```", file, content));
        }
    }
    sections.join("\n\n")
}

fn architect_prompt(task: &Task, tree: &str, files: &str) -> String {
    format!(
        "{}\n\n## Task {}: {}\n\n{}\n\n---\n\n## Repository File Tree\n\n```\n{}\n```\n\n{}\n\n---\n\n\
         Please design a detailed implementation plan for this task.",
        ARCHITECT_PREAMBLE, task.id, task.title, task.description, tree, files
    )
}

/// [`Enricher`] that asks the agent for an implementation plan.
pub struct ArchitectEnricher {
    agent: Arc<dyn CodeAgent>,
    repo_path: PathBuf,
    model: String,
    timeout: Duration,
}

impl ArchitectEnricher {
    pub fn new(agent: Arc<dyn CodeAgent>, repo_path: PathBuf, timeout: Duration) -> Self {
        Self {
            agent,
            repo_path,
            model: "opus".to_string(),
            timeout,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl Enricher for ArchitectEnricher {
    async fn enrich(&self, task: &Task) -> Result<Option<String>> {
        let repo_path = self.repo_path.clone();
        let tree = match blocking(move || tracked_files(&repo_path)).await {
            Ok(files) => files.join("\n"),
            Err(e) => {
                flog_warn!("Could not list tracked files: {}", e);
                "(could not list files)".to_string()
            }
        };
        let files = file_context(&self.repo_path, task);

        flog!("Designing implementation plan for task {}", task.id);
        let run = self
            .agent
            .invoke(AgentRequest {
                prompt: architect_prompt(task, &tree, &files),
                cwd: self.repo_path.clone(),
                model: self.model.clone(),
                max_turns: 1,
                allowed_tools: Vec::new(),
                timeout: self.timeout,
            })
            .await?;
        if !run.is_success() {
            flog_warn!(
                "Architect exited with code {} for task {}: {}",
                run.exit_code,
                task.id,
                truncate(run.stderr.trim(), 300)
            );
            return Ok(None);
        }
        let plan = run.output.trim();
        Ok((!plan.is_empty()).then(|| plan.to_string()))
    }
}
