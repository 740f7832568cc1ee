use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use git2::{BranchType, Commit, ErrorCode, IndexAddOption, Repository, Signature};

use crate::error::classify_command_failure;
use crate::ports::VersionControl;
use crate::util::{blocking, run_command};
use crate::{flog_debug, flog_warn, Error, Result};

const DEFAULT_NET_TIMEOUT: Duration = Duration::from_secs(120);

/// Git operations for worktree-per-attempt execution.
///
/// Local object manipulation goes through git2. Anything that talks to a
/// remote (fetch, push, pull, merge of a fetched ref) shells out to `git`
/// so the user's credential helpers apply.
#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
    base_branch: String,
    remote: String,
    net_timeout: Duration,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        flog_debug!("GitOps::new path={}", repo_path.display());
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self {
            repo_path: root,
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            net_timeout: DEFAULT_NET_TIMEOUT,
        })
    }

    pub fn with_base(mut self, base_branch: &str, remote: &str) -> Self {
        self.base_branch = base_branch.to_string();
        self.remote = remote.to_string();
        self
    }

    pub fn with_net_timeout(mut self, timeout: Duration) -> Self {
        self.net_timeout = timeout;
        self
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// The base branch tip: local branch first, then its remote-tracking
    /// ref, then HEAD.
    fn base_commit<'r>(&self, repo: &'r Repository) -> Result<Commit<'r>> {
        if let Ok(branch) = repo.find_branch(&self.base_branch, BranchType::Local) {
            return Ok(branch.get().peel_to_commit()?);
        }
        let remote_name = format!("{}/{}", self.remote, self.base_branch);
        if let Ok(branch) = repo.find_branch(&remote_name, BranchType::Remote) {
            return Ok(branch.get().peel_to_commit()?);
        }
        flog_warn!(
            "Base branch '{}' not found, falling back to HEAD",
            self.base_branch
        );
        Ok(repo.head()?.peel_to_commit()?)
    }

    fn add_worktree(repo: &Repository, branch: &str, worktree_path: &Path) -> Result<()> {
        let branch_ref = repo.find_branch(branch, BranchType::Local)?.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the folder name is a safe worktree name.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Create `branch` at the base branch tip and check it out at
    /// `worktree_path`. A leftover worktree at the same path is removed first.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        flog_debug!(
            "GitOps::create_worktree branch={} path={}",
            branch,
            worktree_path.display()
        );
        if worktree_path.exists() {
            flog_warn!("Stale worktree at {}, removing", worktree_path.display());
            self.remove_worktree(worktree_path)?;
        }
        let repo = self.repo()?;
        let commit = self.base_commit(&repo)?;
        flog_debug!("Creating branch {} from commit {}", branch, commit.id());
        repo.branch(branch, &commit, true)?;
        Self::add_worktree(&repo, branch, worktree_path)?;
        flog_debug!("Worktree created successfully");
        Ok(())
    }

    /// Check out an existing branch at `worktree_path`, creating the local
    /// branch from its remote-tracking ref when only the remote has it.
    pub fn create_worktree_from_branch(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        flog_debug!(
            "GitOps::create_worktree_from_branch branch={} path={}",
            branch,
            worktree_path.display()
        );
        if worktree_path.exists() {
            self.remove_worktree(worktree_path)?;
        }
        let repo = self.repo()?;
        if repo.find_branch(branch, BranchType::Local).is_err() {
            let remote_name = format!("{}/{}", self.remote, branch);
            let commit = repo
                .find_branch(&remote_name, BranchType::Remote)
                .map_err(|_| Error::NotFound(format!("branch {}", branch)))?
                .get()
                .peel_to_commit()?;
            repo.branch(branch, &commit, false)?;
        }
        Self::add_worktree(&repo, branch, worktree_path)
    }

    /// Remove a worktree and clean up all associated resources.
    /// Cleanup continues past individual failures; the branch must end up
    /// fully detached from the worktree or later deletion fails with
    /// "branch is already checked out".
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        flog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        let worktree_name: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || folder_name.as_deref() == Some(*name)
            })
            .map(|s| s.to_string());

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    flog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // A surviving .git/worktrees/<name> makes git think the branch is
        // still checked out.
        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                flog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Stage all changes, deletions included, and commit them.
    /// Returns `false` without committing when the tree is unchanged.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<bool> {
        flog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if parent.as_ref().is_some_and(|p| p.tree_id() == tree_id) {
            flog_debug!("Nothing to commit in {}", worktree_path.display());
            return Ok(false);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Foreman", "foreman@localhost"))?;
        let parents: Vec<&Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        flog_debug!("Commit created: {}", commit_id);
        Ok(true)
    }

    /// The commit where the workspace branch left the base branch.
    fn fork_point<'r>(&self, repo: &'r Repository) -> Result<(Commit<'r>, Commit<'r>)> {
        let head = repo.head()?.peel_to_commit()?;
        let base = self.base_commit(repo)?;
        let fork = repo.merge_base(base.id(), head.id())?;
        Ok((repo.find_commit(fork)?, head))
    }

    pub fn commits_ahead(&self, worktree_path: &Path) -> Result<usize> {
        let repo = Repository::open(worktree_path)?;
        let head = repo.head()?.peel_to_commit()?;
        let base = self.base_commit(&repo)?;
        let mut walk = repo.revwalk()?;
        walk.push(head.id())?;
        walk.hide(base.id())?;
        Ok(walk.count())
    }

    pub fn changed_files(&self, worktree_path: &Path) -> Result<Vec<String>> {
        let repo = Repository::open(worktree_path)?;
        let (fork, head) = self.fork_point(&repo)?;
        let diff = repo.diff_tree_to_tree(Some(&fork.tree()?), Some(&head.tree()?), None)?;
        let mut files: Vec<String> = diff
            .deltas()
            .filter_map(|d| d.new_file().path().or_else(|| d.old_file().path()))
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Put `file` back to its content at the fork point, or delete it when
    /// it did not exist there. The change is left uncommitted.
    pub fn revert_file(&self, worktree_path: &Path, file: &str) -> Result<()> {
        let repo = Repository::open(worktree_path)?;
        let (fork, _) = self.fork_point(&repo)?;
        let target = worktree_path.join(file);
        match fork.tree()?.get_path(Path::new(file)) {
            Ok(entry) => {
                let blob = repo.find_blob(entry.id())?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, blob.content())?;
                flog_debug!("Restored {} from base", file);
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                if target.exists() {
                    std::fs::remove_file(&target)?;
                }
                flog_debug!("Deleted {} (not in base)", file);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Delete a local branch. Returns Ok even if the branch doesn't exist.
    pub fn delete_local_branch(&self, branch: &str) -> Result<()> {
        flog_debug!("GitOps::delete_local_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    flog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                flog_debug!("Branch '{}' not found (already deleted?)", branch);
            }
            Err(e) => flog_warn!("Error looking up branch '{}': {}", branch, e),
        }
        Ok(())
    }

    pub fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = repo.head()?;
        Ok(head
            .is_branch()
            .then(|| head.shorthand().map(String::from))
            .flatten())
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let out = run_command("git", args, cwd, self.net_timeout, &[]).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            let label = format!("git {}", args.first().copied().unwrap_or_default());
            Err(classify_command_failure(&label, &out.stderr))
        }
    }
}

#[async_trait]
impl VersionControl for GitOps {
    async fn prepare_workspace(&self, branch: &str, path: &Path) -> Result<()> {
        // Best effort: a stale remote-tracking ref only makes the fork older.
        if let Err(e) = self
            .git(&self.repo_path, &["fetch", &self.remote, &self.base_branch])
            .await
        {
            flog_warn!("Fetch of {} failed: {}", self.base_branch, e);
        }
        let this = self.clone();
        let (branch, path) = (branch.to_string(), path.to_path_buf());
        blocking(move || this.create_worktree(&branch, &path)).await
    }

    async fn checkout_workspace(&self, branch: &str, path: &Path) -> Result<()> {
        let refspec = format!("{}:refs/remotes/{}/{}", branch, self.remote, branch);
        if let Err(e) = self.git(&self.repo_path, &["fetch", &self.remote, &refspec]).await {
            flog_warn!("Fetch of {} failed: {}", branch, e);
        }
        let this = self.clone();
        let (branch, path) = (branch.to_string(), path.to_path_buf());
        blocking(move || this.create_worktree_from_branch(&branch, &path)).await
    }

    async fn release_workspace(&self, path: &Path) -> Result<()> {
        let this = self.clone();
        let path = path.to_path_buf();
        blocking(move || this.remove_worktree(&path)).await
    }

    async fn commit_pending(&self, path: &Path, message: &str) -> Result<bool> {
        let this = self.clone();
        let (path, message) = (path.to_path_buf(), message.to_string());
        blocking(move || this.commit_all(&path, &message)).await
    }

    async fn commits_ahead(&self, path: &Path) -> Result<usize> {
        let this = self.clone();
        let path = path.to_path_buf();
        blocking(move || GitOps::commits_ahead(&this, &path)).await
    }

    async fn changed_files(&self, path: &Path) -> Result<Vec<String>> {
        let this = self.clone();
        let path = path.to_path_buf();
        blocking(move || GitOps::changed_files(&this, &path)).await
    }

    async fn revert_file(&self, path: &Path, file: &str) -> Result<()> {
        let this = self.clone();
        let (path, file) = (path.to_path_buf(), file.to_string());
        blocking(move || GitOps::revert_file(&this, &path, &file)).await
    }

    async fn push(&self, path: &Path, branch: &str) -> Result<()> {
        self.git(path, &["push", "-u", &self.remote, branch, "--force"])
            .await
            .map(|_| ())
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        if let Err(e) = self
            .git(&self.repo_path, &["push", &self.remote, "--delete", branch])
            .await
        {
            flog_debug!("Remote delete of {} skipped: {}", branch, e);
        }
        let this = self.clone();
        let branch = branch.to_string();
        blocking(move || this.delete_local_branch(&branch)).await
    }

    async fn merge_base_into(&self, path: &Path) -> Result<Vec<String>> {
        self.git(path, &["fetch", &self.remote, &self.base_branch]).await?;
        let upstream = format!("{}/{}", self.remote, self.base_branch);
        let merged = run_command(
            "git",
            &["merge", &upstream, "--no-edit"],
            path,
            self.net_timeout,
            &[],
        )
        .await?;
        if merged.success() {
            return Ok(Vec::new());
        }
        let conflicted = self
            .git(path, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        let files: Vec<String> = conflicted
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if files.is_empty() {
            return Err(classify_command_failure("git merge", &merged.stderr));
        }
        Ok(files)
    }

    async fn incoming_changes(&self, path: &Path) -> Result<String> {
        let range = format!("HEAD..{}/{}", self.remote, self.base_branch);
        self.git(path, &["log", "--oneline", "--stat", &range]).await
    }

    async fn sync_base(&self) -> Result<()> {
        let this = self.clone();
        let current = blocking(move || this.current_branch()).await?;
        if current.as_deref() == Some(self.base_branch.as_str()) {
            self.git(&self.repo_path, &["pull", "--ff-only", &self.remote, &self.base_branch])
                .await?;
        } else {
            let refspec = format!("{}:{}", self.base_branch, self.base_branch);
            self.git(&self.repo_path, &["fetch", &self.remote, &refspec]).await?;
        }
        Ok(())
    }
}
