//! Execution of one task attempt.
//!
//! A [`Worker`] owns a fresh worktree for a single attempt, runs the agent in
//! it, and turns the agent's commits into a published change request. Every
//! failure is folded into the returned [`ExecutionResult`]; nothing escapes
//! `run`. The worktree is always released and an attempt log is always
//! written, including when the run is cancelled mid-attempt.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{Artifact, ExecutionOutcome, ExecutionResult, Task};
use crate::orchestration::retry::{is_missing_label, RetryPolicy};
use crate::ports::{AgentRequest, ChangeRequest, CodeAgent, Collaborators, Hosting, VersionControl};
use crate::util::{slugify, truncate};
use crate::{flog, flog_debug, flog_error, flog_warn, Error, Result};

/// Settings shared by every worker of a run.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub base_branch: String,
    pub worktree_dir: PathBuf,
    pub log_dir: PathBuf,
    pub timeout: Duration,
    pub allowed_tools: Vec<String>,
    pub pr_label: Option<String>,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_branch: config.base_branch.clone(),
            worktree_dir: config.worktrees_dir(),
            log_dir: config.logs_dir(),
            timeout: config.timeout(),
            allowed_tools: config.allowed_tools.clone(),
            pr_label: (!config.pr_label.is_empty()).then(|| config.pr_label.clone()),
            retry: RetryPolicy::default(),
        }
    }
}

/// `""` for the first attempt, `-retry-N` afterwards.
pub fn retry_suffix(attempt: u32) -> String {
    if attempt == 0 {
        String::new()
    } else {
        format!("-retry-{}", attempt)
    }
}

/// Workspace key shared by the branch and worktree directory names.
pub fn workspace_key(task: &Task, attempt: u32) -> String {
    format!("{}-{}{}", task.id, slugify(&task.title), retry_suffix(attempt))
}

pub fn branch_name(task: &Task, attempt: u32) -> String {
    format!("agent/{}", workspace_key(task, attempt))
}

/// What was learned about the attempt before it finished or failed.
#[derive(Debug, Default)]
struct Progress {
    output: Option<String>,
    files_changed: Vec<String>,
    cost_usd: Option<f64>,
    num_turns: Option<u32>,
}

pub struct Worker {
    id: String,
    task: Task,
    branch: String,
    worktree: PathBuf,
    agent: Arc<dyn CodeAgent>,
    vcs: Arc<dyn VersionControl>,
    hosting: Arc<dyn Hosting>,
    settings: Arc<WorkerSettings>,
    cancel: CancellationToken,
    journal: Vec<String>,
}

impl Worker {
    pub fn new(
        task: Task,
        attempt: u32,
        collaborators: &Collaborators,
        settings: Arc<WorkerSettings>,
    ) -> Self {
        let key = workspace_key(&task, attempt);
        let id = format!("w-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        Self {
            id,
            branch: format!("agent/{}", key),
            worktree: settings.worktree_dir.join(&key),
            task,
            agent: collaborators.agent.clone(),
            vcs: collaborators.vcs.clone(),
            hosting: collaborators.hosting.clone(),
            settings,
            cancel: CancellationToken::new(),
            journal: Vec::new(),
        }
    }

    /// Abandon the attempt when `cancel` fires. Cleanup still runs.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the attempt to completion.
    pub async fn run(mut self) -> ExecutionResult {
        let started_at = Utc::now();
        flog!(
            "Worker {} starting task {} on {}",
            self.id,
            self.task.id,
            self.branch
        );
        let mut progress = Progress::default();
        let cancel = self.cancel.clone();
        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.execute(&mut progress) => result,
        };
        let outcome = match executed {
            Ok(artifact) => {
                flog!(
                    "Task {} produced change request #{}: {}",
                    self.task.id,
                    artifact.number,
                    artifact.url
                );
                ExecutionOutcome::Succeeded {
                    artifact: Some(artifact),
                }
            }
            Err(e) => {
                flog_error!("Task {} failed: {}", self.task.id, e);
                self.note(format!("error: {}", e));
                ExecutionOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        if let Err(e) = self.vcs.release_workspace(&self.worktree).await {
            flog_warn!(
                "Failed to remove worktree {}: {}",
                self.worktree.display(),
                e
            );
        }

        let result = ExecutionResult {
            task_id: self.task.id.clone(),
            branch: self.branch.clone(),
            outcome,
            output: progress.output,
            files_changed: progress.files_changed,
            started_at,
            finished_at: Utc::now(),
            cost_usd: progress.cost_usd,
            num_turns: progress.num_turns,
        };
        self.save_log(&result);
        result
    }

    async fn execute(&mut self, progress: &mut Progress) -> Result<Artifact> {
        self.vcs
            .prepare_workspace(&self.branch, &self.worktree)
            .await
            .map_err(|e| Error::Execution(format!("Workspace setup failed: {}", e)))?;
        self.note(format!("worktree ready at {}", self.worktree.display()));

        self.run_agent(progress).await?;
        progress.files_changed = self.verify_changes().await?;

        let retry = self.settings.retry.clone();
        retry
            .run("git push", || self.vcs.push(&self.worktree, &self.branch))
            .await
            .map_err(|e| Error::Execution(format!("git push failed: {}", e)))?;
        self.note(format!("pushed {}", self.branch));

        self.create_change_request(&progress.files_changed).await
    }

    async fn run_agent(&mut self, progress: &mut Progress) -> Result<()> {
        let request = AgentRequest {
            prompt: self.prompt(),
            cwd: self.worktree.clone(),
            model: self.task.model.clone(),
            max_turns: self.task.max_turns,
            allowed_tools: self.settings.allowed_tools.clone(),
            timeout: self.settings.timeout,
        };
        self.note(format!(
            "agent start model={} max_turns={}",
            request.model, request.max_turns
        ));
        let run = self.agent.invoke(request).await.map_err(|e| match e {
            Error::Timeout(d) => Error::Execution(format!("Agent timed out after {}s", d.as_secs())),
            other => Error::Execution(format!("Agent invocation failed: {}", other)),
        })?;

        progress.cost_usd = run.cost_usd;
        progress.num_turns = run.num_turns;
        progress.output = Some(run.output.clone());
        self.note(format!(
            "agent exit={} cost={:?} turns={:?} output={} chars",
            run.exit_code,
            run.cost_usd,
            run.num_turns,
            run.output.len()
        ));

        if !run.is_success() {
            let detail = if run.stderr.trim().is_empty() {
                run.output.trim()
            } else {
                run.stderr.trim()
            };
            return Err(Error::Execution(format!(
                "Agent exited with code {}: {}",
                run.exit_code,
                truncate(detail, 500)
            )));
        }
        Ok(())
    }

    /// Commit leftovers, require at least one commit, then revert anything
    /// outside the allowlist. Returns the files that remain changed.
    async fn verify_changes(&mut self) -> Result<Vec<String>> {
        let message = format!(
            "[agent] chore: auto-commit remaining changes for {}",
            self.task.id
        );
        if self.vcs.commit_pending(&self.worktree, &message).await? {
            flog_warn!("Auto-committed leftover changes for task {}", self.task.id);
            self.note("auto-committed leftover changes".to_string());
        }

        if self.vcs.commits_ahead(&self.worktree).await? == 0 {
            return Err(Error::Execution(format!(
                "No commits ahead of {}; nothing to push",
                self.settings.base_branch
            )));
        }

        let changed = self.vcs.changed_files(&self.worktree).await?;
        let unauthorized: Vec<String> = changed
            .iter()
            .filter(|f| !self.task.allows(f))
            .cloned()
            .collect();
        if unauthorized.is_empty() {
            flog_debug!("Task {} changed {:?}", self.task.id, changed);
            return Ok(changed);
        }

        flog_warn!(
            "Task {} touched files outside its allowlist, reverting: {:?}",
            self.task.id,
            unauthorized
        );
        for file in &unauthorized {
            self.vcs.revert_file(&self.worktree, file).await?;
        }
        let message = format!(
            "[agent] chore: revert unauthorized changes for {}",
            self.task.id
        );
        self.vcs.commit_pending(&self.worktree, &message).await?;
        self.note(format!("reverted {:?}", unauthorized));

        let remaining = self.vcs.changed_files(&self.worktree).await?;
        if remaining.is_empty() {
            return Err(Error::Execution(format!(
                "No authorized changes left after reverting {}",
                unauthorized.join(", ")
            )));
        }
        Ok(remaining)
    }

    async fn create_change_request(&mut self, files: &[String]) -> Result<Artifact> {
        let mut request = ChangeRequest {
            title: format!("[Agent] {}", self.task.title),
            body: self.pr_body(files),
            base: self.settings.base_branch.clone(),
            head: self.branch.clone(),
            label: self.settings.pr_label.clone(),
        };
        let retry = self.settings.retry.clone();
        let hosting = self.hosting.clone();

        let first = retry
            .run("create change request", || hosting.create_change_request(&request))
            .await;
        let artifact = match first {
            Err(e) if is_missing_label(&e) && request.label.is_some() => {
                flog_warn!("Label {:?} not found, retrying without label", request.label);
                request.label = None;
                retry
                    .run("create change request", || hosting.create_change_request(&request))
                    .await
            }
            other => other,
        }
        .map_err(|e| Error::Execution(format!("Failed to create change request: {}", e)))?;

        self.note(format!("created change request {}", artifact.url));
        Ok(artifact)
    }

    fn prompt(&self) -> String {
        let mut prompt = format!("{}\n\n", self.task.description);
        if !self.task.files_touched.is_empty() {
            prompt.push_str("Only modify these files:\n");
            for file in &self.task.files_touched {
                prompt.push_str(&format!("- {}\n", file));
            }
            prompt.push('\n');
        }
        prompt.push_str(&format!(
            "After making your changes:\n\
             1. Run the project's tests and make sure they pass\n\
             2. Stage all changes with git add -A\n\
             3. Commit with message: [agent] feat: {}\n\
             4. Do NOT push\n\
             5. Do NOT modify files in .github/",
            self.task.title
        ));
        prompt
    }

    fn pr_body(&self, files: &[String]) -> String {
        let files_section = if files.is_empty() {
            "- None detected".to_string()
        } else {
            files
                .iter()
                .map(|f| format!("- `{}`", f))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "## Task\n\n**ID:** `{}`\n**Title:** {}\n\n## Description\n\n{}\n\n\
             ## Files Changed\n\n{}\n\n## Details\n\n- **Worker:** `{}`\n- **Model:** `{}`\n\n\
             ---\n*Automated change request created by foreman*",
            self.task.id,
            self.task.title,
            self.task.description,
            files_section,
            self.id,
            self.task.model
        )
    }

    fn note(&mut self, message: String) {
        self.journal
            .push(format!("[{}] {}", Utc::now().to_rfc3339(), message));
    }

    fn save_log(&self, result: &ExecutionResult) {
        let path = self
            .settings
            .log_dir
            .join(format!("{}-{}.log", self.id, self.task.id));
        let content = format!(
            "task_id: {}\nworker_id: {}\nbranch: {}\nsuccess: {}\nelapsed: {:.1}s\nerror: {}\nfiles_changed: {:?}\n---\n{}\n",
            self.task.id,
            self.id,
            self.branch,
            result.is_success(),
            result.elapsed_seconds(),
            result.error().unwrap_or("-"),
            result.files_changed,
            self.journal.join("\n")
        );
        let written = std::fs::create_dir_all(&self.settings.log_dir)
            .and_then(|_| std::fs::write(&path, content));
        match written {
            Ok(()) => flog_debug!("Attempt log saved to {}", path.display()),
            Err(e) => flog_warn!("Failed to save attempt log {}: {}", path.display(), e),
        }
    }
}
