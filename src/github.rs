//! GitHub access through the `gh` command-line tool.
//!
//! [`GhCli`] implements both [`Hosting`] (pull requests, comments, issue
//! creation) and [`WorkItemSource`] (labelled issues as work items). Calls
//! that hit the API are wrapped in a [`RetryPolicy`] so rate limiting and
//! network blips do not fail a whole task.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde::Deserialize;

use crate::core::{Artifact, TaskId, WorkItem};
use crate::error::classify_command_failure;
use crate::orchestration::retry::{is_missing_label, RetryPolicy};
use crate::ports::{ChangeRequest, Hosting, Mergeability, NewIssue, ReviewMaterial, WorkItemSource};
use crate::util::run_command;
use crate::{flog, flog_debug, flog_warn, Error, Result};

/// Label added to issues whose task failed.
pub const FAILED_LABEL: &str = "agent-failed";

const LIST_LIMIT: &str = "200";

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<RawLabel>,
}

impl From<RawIssue> for WorkItem {
    fn from(raw: RawIssue) -> Self {
        WorkItem {
            number: raw.number,
            title: raw.title,
            body: raw.body.unwrap_or_default(),
            labels: raw.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTitle {
    title: String,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    path: String,
}

#[derive(Debug, Deserialize)]
struct RawPrView {
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawMergeable {
    #[serde(default)]
    mergeable: String,
}

#[derive(Debug, Deserialize)]
struct RawPr {
    number: u64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct RawUrl {
    url: String,
}

pub fn parse_issues(json: &str) -> Result<Vec<WorkItem>> {
    let raw: Vec<RawIssue> = serde_json::from_str(json)?;
    Ok(raw.into_iter().map(WorkItem::from).collect())
}

pub fn parse_titles(json: &str) -> Result<Vec<String>> {
    let raw: Vec<RawTitle> = serde_json::from_str(json)?;
    Ok(raw.into_iter().map(|t| t.title).collect())
}

pub fn parse_label_names(json: &str) -> Result<Vec<String>> {
    let raw: Vec<RawLabel> = serde_json::from_str(json)?;
    Ok(raw.into_iter().map(|l| l.name).collect())
}

/// The change request URL `gh pr create` prints as its last line.
fn last_url(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| l.starts_with("http"))
}

/// Number of the merged PR among `prs_json` whose title references
/// `issue-{number}` as a whole word.
pub fn resolving_pr(prs_json: &str, number: u64) -> Result<Option<u64>> {
    let prs: Vec<RawPr> = serde_json::from_str(prs_json)?;
    let pattern = Regex::new(&format!(r"\bissue-{}\b", number))
        .map_err(|e| Error::Execution(e.to_string()))?;
    Ok(prs
        .into_iter()
        .find(|pr| pattern.is_match(&pr.title))
        .map(|pr| pr.number))
}

/// `gh`-backed hosting service and work item source.
#[derive(Debug, Clone)]
pub struct GhCli {
    binary: PathBuf,
    repo_path: PathBuf,
    remote: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl GhCli {
    /// Locate `command` on `PATH`.
    pub fn new(command: &str, repo_path: &Path, timeout: Duration) -> Result<Self> {
        let binary =
            which::which(command).map_err(|_| Error::CommandNotFound(command.to_string()))?;
        Ok(Self::with_binary(binary, repo_path, timeout))
    }

    pub fn with_binary(binary: PathBuf, repo_path: &Path, timeout: Duration) -> Self {
        Self {
            binary,
            repo_path: repo_path.to_path_buf(),
            remote: "origin".to_string(),
            timeout,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_remote(mut self, remote: &str) -> Self {
        self.remote = remote.to_string();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        let program = self.binary.to_string_lossy();
        let out = run_command(&program, args, &self.repo_path, self.timeout, &[]).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            let label = format!("gh {}", args.iter().take(2).copied().collect::<Vec<_>>().join(" "));
            Err(classify_command_failure(&label, &out.stderr))
        }
    }

    async fn gh_retry(&self, what: &str, args: &[&str]) -> Result<String> {
        self.retry.run(what, || self.gh(args)).await
    }

    async fn existing_pr(&self, head: &str) -> Result<Artifact> {
        let out = self.gh(&["pr", "view", head, "--json", "url"]).await?;
        let raw: RawUrl = serde_json::from_str(&out)?;
        Artifact::from_url(&raw.url, head)
            .ok_or_else(|| Error::Execution(format!("Unparseable PR URL: {}", raw.url)))
    }

    /// Head-branch content of `files`; unreadable files are skipped.
    async fn head_contents(&self, branch: &str, files: &[String]) -> Vec<(String, String)> {
        let git = |args: Vec<String>| async move {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            run_command("git", &args, &self.repo_path, self.timeout, &[]).await
        };
        if let Err(e) = git(vec!["fetch".into(), self.remote.clone(), branch.to_string()]).await {
            flog_warn!("Fetch of {} failed: {}", branch, e);
        }
        let reads = files.iter().map(|file| {
            let spec = format!("{}/{}:{}", self.remote, branch, file);
            let read = git(vec!["show".into(), spec]);
            async move {
                match read.await {
                    Ok(out) if out.success() => Some((file.clone(), out.stdout)),
                    Ok(_) => {
                        flog_debug!("{} not on {} (deleted?)", file, branch);
                        None
                    }
                    Err(e) => {
                        flog_warn!("Could not read {}: {}", file, e);
                        None
                    }
                }
            }
        });
        join_all(reads).await.into_iter().flatten().collect()
    }

    /// Fetch a single open issue as a work item.
    pub async fn fetch_issue(&self, number: u64) -> Result<WorkItem> {
        let number = number.to_string();
        let out = self
            .gh_retry(
                "gh issue view",
                &["issue", "view", &number, "--json", "number,title,body,labels"],
            )
            .await?;
        let raw: RawIssue = serde_json::from_str(&out)?;
        Ok(raw.into())
    }

    async fn close_resolved(&self, item: &WorkItem, pr: u64, label: &str) {
        let number = item.number.to_string();
        let body = format!("Issue already resolved by merged PR #{}", pr);
        let steps: [Vec<&str>; 3] = [
            vec!["issue", "comment", &number, "--body", &body],
            vec!["issue", "edit", &number, "--remove-label", label],
            vec!["issue", "close", &number],
        ];
        for args in steps {
            if let Err(e) = self.gh(&args).await {
                flog_warn!("Cleanup of resolved issue #{} failed: {}", item.number, e);
            }
        }
    }
}

#[async_trait]
impl Hosting for GhCli {
    async fn create_change_request(&self, request: &ChangeRequest) -> Result<Artifact> {
        let mut args = vec![
            "pr",
            "create",
            "--title",
            &request.title,
            "--body",
            &request.body,
            "--base",
            &request.base,
            "--head",
            &request.head,
        ];
        let base_len = args.len();
        if let Some(label) = &request.label {
            args.extend(["--label", label.as_str()]);
        }

        let out = match self.gh_retry("gh pr create", &args).await {
            Ok(out) => out,
            Err(e) if is_missing_label(&e) => {
                flog_warn!("Label missing, creating PR without it: {}", e);
                self.gh_retry("gh pr create", &args[..base_len]).await?
            }
            Err(Error::AlreadyExists(msg)) => {
                flog!("PR for {} already exists, reusing it: {}", request.head, msg);
                return self.existing_pr(&request.head).await;
            }
            Err(e) => return Err(e),
        };

        let url = last_url(&out)
            .ok_or_else(|| Error::Execution(format!("gh pr create printed no URL: {}", out.trim())))?;
        Artifact::from_url(url, &request.head)
            .ok_or_else(|| Error::Execution(format!("Unparseable PR URL: {}", url)))
    }

    async fn review_material(&self, artifact: &Artifact) -> Result<ReviewMaterial> {
        let number = artifact.number.to_string();
        let diff = self.gh_retry("gh pr diff", &["pr", "diff", &number]).await?;
        let view = self
            .gh_retry("gh pr view", &["pr", "view", &number, "--json", "title,body,files"])
            .await?;
        let raw: RawPrView = serde_json::from_str(&view)?;
        let files: Vec<String> = raw.files.into_iter().map(|f| f.path).collect();
        let contents = self.head_contents(&artifact.branch, &files).await;
        Ok(ReviewMaterial {
            title: raw.title,
            body: raw.body.unwrap_or_default(),
            diff,
            files,
            contents,
        })
    }

    async fn mergeability(&self, artifact: &Artifact) -> Result<Mergeability> {
        let number = artifact.number.to_string();
        let out = self
            .gh_retry("gh pr view", &["pr", "view", &number, "--json", "mergeable"])
            .await?;
        let raw: RawMergeable = serde_json::from_str(&out)?;
        Ok(Mergeability::parse(&raw.mergeable))
    }

    async fn merge(&self, artifact: &Artifact) -> Result<()> {
        let number = artifact.number.to_string();
        self.gh_retry(
            "gh pr merge",
            &["pr", "merge", &number, "--squash", "--delete-branch"],
        )
        .await?;
        flog!("Merged {}", artifact.url);
        Ok(())
    }

    async fn comment(&self, artifact: &Artifact, body: &str) -> Result<()> {
        let number = artifact.number.to_string();
        self.gh_retry("gh pr comment", &["pr", "comment", &number, "--body", body])
            .await?;
        Ok(())
    }

    async fn open_issue_titles(&self) -> Result<Vec<String>> {
        let out = self
            .gh_retry(
                "gh issue list",
                &["issue", "list", "--state", "open", "--limit", LIST_LIMIT, "--json", "title"],
            )
            .await?;
        parse_titles(&out)
    }

    async fn label_exists(&self, label: &str) -> Result<bool> {
        let out = self
            .gh_retry(
                "gh label list",
                &["label", "list", "--limit", LIST_LIMIT, "--json", "name"],
            )
            .await?;
        Ok(parse_label_names(&out)?.iter().any(|name| name == label))
    }

    async fn create_issue(&self, issue: &NewIssue) -> Result<String> {
        let mut args = vec!["issue", "create", "--title", &issue.title, "--body", &issue.body];
        for label in &issue.labels {
            args.extend(["--label", label.as_str()]);
        }
        let out = self.gh_retry("gh issue create", &args).await?;
        last_url(&out)
            .map(str::to_string)
            .ok_or_else(|| Error::Execution(format!("gh issue create printed no URL: {}", out.trim())))
    }

    async fn comment_issue(&self, number: u64, body: &str) -> Result<()> {
        let number = number.to_string();
        self.gh_retry("gh issue comment", &["issue", "comment", &number, "--body", body])
            .await?;
        Ok(())
    }

    async fn relabel_issue(&self, number: u64, remove: &str, add: &str) -> Result<()> {
        let number = number.to_string();
        self.gh_retry(
            "gh issue edit",
            &["issue", "edit", &number, "--remove-label", remove, "--add-label", add],
        )
        .await?;
        Ok(())
    }

    async fn create_label(&self, name: &str, color: &str, description: &str) -> Result<()> {
        match self
            .gh_retry(
                "gh label create",
                &["label", "create", name, "--color", color, "--description", description],
            )
            .await
        {
            Err(Error::AlreadyExists(_)) => {
                flog_debug!("Label {} already exists", name);
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

#[async_trait]
impl WorkItemSource for GhCli {
    async fn list_ready_items(&self, label: &str) -> Result<Vec<WorkItem>> {
        let out = self
            .gh_retry(
                "gh issue list",
                &[
                    "issue", "list", "--label", label, "--state", "open", "--limit", LIST_LIMIT,
                    "--json", "number,title,body,labels",
                ],
            )
            .await?;
        let items = parse_issues(&out)?;

        let mut ready = Vec::with_capacity(items.len());
        for item in items {
            let search = format!("issue-{} in:title", item.number);
            let merged = self
                .gh_retry(
                    "gh pr list",
                    &["pr", "list", "--state", "merged", "--search", &search, "--json", "number,title"],
                )
                .await;
            let resolved = match merged {
                Ok(json) => resolving_pr(&json, item.number).unwrap_or_else(|e| {
                    flog_warn!("Bad PR search output for #{}: {}", item.number, e);
                    None
                }),
                Err(e) => {
                    flog_warn!("PR search for #{} failed: {}", item.number, e);
                    None
                }
            };
            match resolved {
                Some(pr) => {
                    flog!("Issue #{} already resolved by PR #{}, closing", item.number, pr);
                    self.close_resolved(&item, pr, label).await;
                }
                None => ready.push(item),
            }
        }
        flog!("{} ready issue(s) labelled '{}'", ready.len(), label);
        Ok(ready)
    }

    async fn mark_complete(&self, task_id: &TaskId, artifact_url: &str) -> Result<()> {
        let Some(number) = task_id.issue_number() else {
            return Ok(());
        };
        let number = number.to_string();
        let body = format!("Completed. PR: {}", artifact_url);
        self.gh_retry("gh issue comment", &["issue", "comment", &number, "--body", &body])
            .await?;
        self.gh_retry("gh issue close", &["issue", "close", &number]).await?;
        Ok(())
    }

    async fn mark_failed(&self, task_id: &TaskId, error: &str) -> Result<()> {
        let Some(number) = task_id.issue_number() else {
            return Ok(());
        };
        let number = number.to_string();
        let body = format!("Agent failed.\n\n```\n{}\n```", error);
        self.gh_retry("gh issue comment", &["issue", "comment", &number, "--body", &body])
            .await?;
        match self
            .gh(&["issue", "edit", &number, "--add-label", FAILED_LABEL])
            .await
        {
            Err(e) if is_missing_label(&e) => {
                flog_warn!("Label '{}' missing on repository: {}", FAILED_LABEL, e);
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}
