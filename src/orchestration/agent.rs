//! Claude Code headless executor.
//!
//! [`ClaudeCli`] runs Claude Code non-interactively (`-p` with JSON output)
//! and maps the JSON envelope onto an [`AgentRun`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::ports::{AgentRequest, AgentRun, CodeAgent};
use crate::util::run_command;
use crate::{flog_debug, flog_warn};

/// Set by a parent Claude session; a nested CLI refuses to start with it.
const NESTED_SESSION_ENV: &str = "CLAUDECODE";

/// Internal struct for deserializing the Claude JSON envelope.
#[derive(Debug, Deserialize)]
struct RawClaudeResponse {
    subtype: Option<String>,
    result: Option<String>,
    total_cost_usd: Option<f64>,
    num_turns: Option<u32>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Claude Code command-line agent.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    /// Path to the Claude binary.
    binary: PathBuf,
}

impl ClaudeCli {
    /// Locate `command` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CommandNotFound`] if the binary cannot be found.
    pub fn new(command: &str) -> Result<Self> {
        let binary =
            which::which(command).map_err(|_| Error::CommandNotFound(command.to_string()))?;
        Ok(Self { binary })
    }

    /// Use a specific binary path without looking it up.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn args(request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "json".to_string(),
            "--model".to_string(),
            request.model.clone(),
            "--max-turns".to_string(),
            request.max_turns.to_string(),
        ];
        if !request.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(request.allowed_tools.join(","));
        }
        args.push("--dangerously-skip-permissions".to_string());
        args
    }

    /// Map the JSON envelope onto an [`AgentRun`].
    ///
    /// An error subtype forces a non-zero exit code even if the process
    /// itself exited cleanly.
    pub fn parse_json_response(json_str: &str, exit_code: i32) -> Result<AgentRun> {
        let raw: RawClaudeResponse = serde_json::from_str(json_str.trim())?;
        let failed = raw.is_error
            || raw
                .subtype
                .as_deref()
                .is_some_and(|s| s.starts_with("error"));
        let output = if failed {
            raw.error.or(raw.result).unwrap_or_default()
        } else {
            raw.result.unwrap_or_default()
        };
        Ok(AgentRun {
            exit_code: if failed && exit_code == 0 { 1 } else { exit_code },
            output,
            stderr: String::new(),
            cost_usd: raw.total_cost_usd,
            num_turns: raw.num_turns,
        })
    }
}

#[async_trait]
impl CodeAgent for ClaudeCli {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentRun> {
        let args = Self::args(&request);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        flog_debug!(
            "ClaudeCli::invoke cwd={} model={} max_turns={} prompt={} chars",
            request.cwd.display(),
            request.model,
            request.max_turns,
            request.prompt.len()
        );
        let binary = self.binary.to_string_lossy();
        let out = run_command(
            &binary,
            &arg_refs,
            &request.cwd,
            request.timeout,
            &[NESTED_SESSION_ENV],
        )
        .await?;

        match Self::parse_json_response(&out.stdout, out.code) {
            Ok(mut run) => {
                run.stderr = out.stderr;
                Ok(run)
            }
            Err(e) => {
                flog_warn!("Agent output was not a JSON envelope: {}", e);
                Ok(AgentRun {
                    exit_code: out.code,
                    output: out.stdout.trim().to_string(),
                    stderr: out.stderr,
                    cost_usd: None,
                    num_turns: None,
                })
            }
        }
    }
}
