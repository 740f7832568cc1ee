//! Merge conflict resolution by agent.
//!
//! The resolver merges the base branch into the change request's head
//! branch and, for each conflicted file, asks the agent for the fully
//! resolved content. Output that still carries conflict markers is
//! rejected.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::Artifact;
use crate::orchestration::retry::RetryPolicy;
use crate::ports::{AgentRequest, CodeAgent, ConflictReport, ConflictResolver, Hosting, VersionControl};
use crate::util::truncate;
use crate::{flog, flog_debug, flog_warn, Error, Result};

const MARKERS: [&str; 2] = ["<<<<<<<", ">>>>>>>"];

/// Whether `content` still has unresolved conflict markers.
pub fn has_conflict_markers(content: &str) -> bool {
    content
        .lines()
        .any(|line| MARKERS.iter().any(|m| line.starts_with(m)))
}

/// Remove a surrounding markdown fence if the agent added one anyway.
fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
        let body = body.trim_end();
        let body = body.strip_suffix("```").unwrap_or(body);
        return format!("{}\n", body.trim_end_matches('\n'));
    }
    text.to_string()
}

fn resolve_prompt(description: &str, incoming: &str, file: &str, conflicted: &str) -> String {
    format!(
        "You are an expert software engineer resolving a merge conflict.\n\n\
         ## Change request description (what this change is trying to do)\n\n{}\n\n\
         ## Changes merged into the base branch since this change branched\n\n{}\n\n\
         ## Conflicted file: {}\n\n\
         The file below contains conflict markers (<<<<<<<, =======, >>>>>>>).\n\
         Resolve the conflicts, keeping BOTH sets of changes where possible.\n\n\
         {}\n\n\
         Output ONLY the fully resolved file content with no conflict markers remaining. \
         Do not include any explanation, markdown fences, or commentary.",
        description, incoming, file, conflicted
    )
}

pub struct AgentConflictResolver {
    agent: Arc<dyn CodeAgent>,
    vcs: Arc<dyn VersionControl>,
    hosting: Arc<dyn Hosting>,
    worktree_dir: PathBuf,
    model: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl AgentConflictResolver {
    pub fn new(
        agent: Arc<dyn CodeAgent>,
        vcs: Arc<dyn VersionControl>,
        hosting: Arc<dyn Hosting>,
        worktree_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            agent,
            vcs,
            hosting,
            worktree_dir,
            model: "sonnet".to_string(),
            timeout,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn resolve_file(
        &self,
        worktree: &Path,
        file: &str,
        description: &str,
        incoming: &str,
    ) -> Result<()> {
        let path = worktree.join(file);
        let conflicted = tokio::fs::read_to_string(&path).await?;
        let run = self
            .agent
            .invoke(AgentRequest {
                prompt: resolve_prompt(description, incoming, file, &conflicted),
                cwd: worktree.to_path_buf(),
                model: self.model.clone(),
                max_turns: 1,
                allowed_tools: Vec::new(),
                timeout: self.timeout,
            })
            .await?;
        if !run.is_success() {
            return Err(Error::Execution(format!(
                "Resolver agent exited with code {} on {}: {}",
                run.exit_code,
                file,
                truncate(run.stderr.trim(), 300)
            )));
        }
        let resolved = strip_fences(&run.output);
        if has_conflict_markers(&resolved) {
            return Err(Error::Execution(format!(
                "Conflict markers remain in {} after resolution",
                file
            )));
        }
        tokio::fs::write(&path, resolved).await?;
        flog_debug!("Resolved conflicts in {}", file);
        Ok(())
    }

    async fn resolve_in(&self, worktree: &Path, artifact: &Artifact) -> Result<Vec<String>> {
        self.vcs.checkout_workspace(&artifact.branch, worktree).await?;
        let conflicted = self.vcs.merge_base_into(worktree).await?;
        if conflicted.is_empty() {
            flog!("Change request #{} merged cleanly with base", artifact.number);
        } else {
            let description = self
                .hosting
                .review_material(artifact)
                .await
                .map(|m| m.body)
                .unwrap_or_default();
            let incoming = match self.vcs.incoming_changes(worktree).await {
                Ok(log) => log,
                Err(e) => {
                    flog_debug!("No incoming change summary for #{}: {}", artifact.number, e);
                    String::new()
                }
            };
            for file in &conflicted {
                self.resolve_file(worktree, file, &description, &incoming)
                    .await?;
            }
        }

        let message = format!(
            "[agent] fix: resolve merge conflicts with base ({} files)",
            conflicted.len()
        );
        self.vcs.commit_pending(worktree, &message).await?;
        self.retry
            .run("git push", || self.vcs.push(worktree, &artifact.branch))
            .await?;
        Ok(conflicted)
    }
}

#[async_trait]
impl ConflictResolver for AgentConflictResolver {
    async fn resolve(&self, artifact: &Artifact) -> Result<ConflictReport> {
        flog!("Resolving conflicts on change request #{}", artifact.number);
        let worktree = self.worktree_dir.join(format!("resolve-{}", artifact.number));
        let outcome = self.resolve_in(&worktree, artifact).await;
        if let Err(e) = self.vcs.release_workspace(&worktree).await {
            flog_warn!("Failed to remove worktree {}: {}", worktree.display(), e);
        }

        let report = match outcome {
            Ok(resolved_files) => {
                if !resolved_files.is_empty() {
                    let list = resolved_files
                        .iter()
                        .map(|f| format!("- `{}`", f))
                        .collect::<Vec<_>>()
                        .join("\n");
                    let body = format!(
                        "## 🔀 Merge conflicts resolved\n\nResolved conflicts in:\n\n{}",
                        list
                    );
                    if let Err(e) = self.hosting.comment(artifact, &body).await {
                        flog_warn!("Failed to comment on #{}: {}", artifact.number, e);
                    }
                }
                ConflictReport {
                    success: true,
                    resolved_files,
                    error: None,
                }
            }
            Err(e) => ConflictReport {
                success: false,
                resolved_files: Vec::new(),
                error: Some(e.to_string()),
            },
        };
        Ok(report)
    }
}
