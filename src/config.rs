use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{flog_debug, Error, Result};

pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "Bash(git add:*)",
    "Bash(git commit:*)",
    "Bash(cargo:*)",
    "Bash(pytest:*)",
    "Bash(python:*)",
    "Bash(ruff:*)",
];

/// Run configuration, read from `foreman.toml`.
///
/// Every field has a default so a partial file (or no file at all) is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub max_workers: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub max_fix_attempts: u32,
    pub extra_fix_buffer: u32,
    pub max_priority: Option<u32>,
    pub poll_interval_ms: u64,
    pub base_branch: String,
    pub remote: String,
    pub label: String,
    pub pr_label: String,
    pub worktree_dir: String,
    pub log_dir: String,
    pub status_path: String,
    pub agent_command: String,
    pub hosting_command: String,
    pub allowed_tools: Vec<String>,
    pub review_timeout_secs: u64,
    pub gh_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub followups: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 2,
            timeout_secs: 600,
            max_retries: 2,
            max_fix_attempts: 2,
            extra_fix_buffer: 3,
            max_priority: None,
            poll_interval_ms: 2000,
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            label: "agent-ready".to_string(),
            pr_label: "agent-created".to_string(),
            worktree_dir: "/tmp/agent-worktrees".to_string(),
            log_dir: "logs".to_string(),
            status_path: "status.json".to_string(),
            agent_command: "claude".to_string(),
            hosting_command: "gh".to_string(),
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|s| s.to_string()).collect(),
            review_timeout_secs: 300,
            gh_timeout_secs: 60,
            drain_timeout_secs: 120,
            followups: true,
        }
    }
}

impl Config {
    pub fn foreman_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    /// Resolve which config file to read: an explicit path, then
    /// `./foreman.toml`, then `~/.foreman/foreman.toml`.
    pub fn config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            return Ok(Some(path.to_path_buf()));
        }
        let local = PathBuf::from("foreman.toml");
        if local.exists() {
            return Ok(Some(local));
        }
        let global = Self::foreman_dir()?.join("foreman.toml");
        Ok(global.exists().then_some(global))
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let Some(path) = Self::config_path(explicit)? else {
            flog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        };
        flog_debug!("Config::load path={}", path.display());
        Self::from_toml(&fs::read_to_string(&path)?)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        flog_debug!(
            "Config loaded: max_workers={}, max_retries={}, max_fix_attempts={}, base={}",
            config.max_workers,
            config.max_retries,
            config.max_fix_attempts,
            config.base_branch
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".to_string()));
        }
        if self.base_branch.trim().is_empty() {
            return Err(Error::Config("base_branch must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        expand_tilde(&self.worktree_dir)
    }

    pub fn logs_dir(&self) -> PathBuf {
        expand_tilde(&self.log_dir)
    }

    pub fn status_file(&self) -> PathBuf {
        expand_tilde(&self.status_path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn review_timeout(&self) -> Duration {
        Duration::from_secs(self.review_timeout_secs)
    }

    pub fn gh_timeout(&self) -> Duration {
        Duration::from_secs(self.gh_timeout_secs)
    }

    /// Grace period for in-flight work after a cancelled run.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.worktrees_dir(), self.logs_dir()] {
            if !dir.exists() {
                flog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
