//! Addresses review feedback on an open change request.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::Artifact;
use crate::orchestration::retry::RetryPolicy;
use crate::orchestration::review::render_feedback;
use crate::ports::{AgentRequest, CodeAgent, FixReport, Fixer, Review, VersionControl};
use crate::util::truncate;
use crate::{flog, flog_warn, Error, Result};

const FIX_COMMIT_MESSAGE: &str = "[agent] fix: address review feedback";

fn fix_prompt(feedback: &str) -> String {
    format!(
        "You are an expert software engineer addressing code review feedback on a change request.\n\n\
         ## Review Feedback\n\n{}\n\n\
         ## Your Task\n\n\
         Read the review comments above carefully, then fix every issue mentioned:\n\n\
         1. Read each file mentioned in the review to understand the current code.\n\
         2. Fix each issue identified in the review.\n\
         3. Run the project's tests to verify your fixes do not break anything.\n\
         4. Stage all changed files with `git add`.\n\
         5. Commit with the message: `{}`\n\
         6. Do NOT push; just commit locally.\n\n\
         If a comment says a test is missing, add it.",
        feedback, FIX_COMMIT_MESSAGE
    )
}

/// [`Fixer`] that runs the agent in a worktree of the change request's
/// head branch and pushes whatever it commits.
pub struct AgentFixer {
    agent: Arc<dyn CodeAgent>,
    vcs: Arc<dyn VersionControl>,
    worktree_dir: PathBuf,
    model: String,
    max_turns: u32,
    allowed_tools: Vec<String>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl AgentFixer {
    pub fn new(
        agent: Arc<dyn CodeAgent>,
        vcs: Arc<dyn VersionControl>,
        worktree_dir: PathBuf,
        allowed_tools: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            agent,
            vcs,
            worktree_dir,
            model: "sonnet".to_string(),
            max_turns: 30,
            allowed_tools,
            timeout,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fix_in(&self, worktree: &Path, artifact: &Artifact, review: &Review) -> Result<String> {
        self.vcs.checkout_workspace(&artifact.branch, worktree).await?;

        let run = self
            .agent
            .invoke(AgentRequest {
                prompt: fix_prompt(&render_feedback(review)),
                cwd: worktree.to_path_buf(),
                model: self.model.clone(),
                max_turns: self.max_turns,
                allowed_tools: self.allowed_tools.clone(),
                timeout: self.timeout,
            })
            .await?;
        if !run.is_success() {
            return Err(Error::Execution(format!(
                "Fix agent exited with code {}: {}",
                run.exit_code,
                truncate(run.stderr.trim(), 500)
            )));
        }

        self.vcs.commit_pending(worktree, FIX_COMMIT_MESSAGE).await?;
        self.retry
            .run("git push", || self.vcs.push(worktree, &artifact.branch))
            .await?;
        Ok(truncate(run.output.trim(), 1500))
    }
}

#[async_trait]
impl Fixer for AgentFixer {
    async fn fix(&self, artifact: &Artifact, review: &Review) -> Result<FixReport> {
        flog!(
            "Fixing change request #{} ({} error findings)",
            artifact.number,
            review.error_count()
        );
        let worktree = self.worktree_dir.join(format!("fix-{}", artifact.number));
        let outcome = self.fix_in(&worktree, artifact, review).await;
        if let Err(e) = self.vcs.release_workspace(&worktree).await {
            flog_warn!("Failed to remove worktree {}: {}", worktree.display(), e);
        }
        Ok(match outcome {
            Ok(summary) => FixReport {
                success: true,
                summary,
                error: None,
            },
            Err(e) => FixReport {
                success: false,
                summary: String::new(),
                error: Some(e.to_string()),
            },
        })
    }
}
