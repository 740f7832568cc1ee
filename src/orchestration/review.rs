//! Agent-driven change request review.
//!
//! The evaluator prompts the agent with the diff and full file contents,
//! expects a JSON verdict back, and posts a rendered summary on the change
//! request.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::core::Artifact;
use crate::ports::{
    AgentRequest, CodeAgent, Evaluator, Finding, Hosting, Review, ReviewMaterial, Severity,
    Verdict,
};
use crate::util::truncate;
use crate::{flog, flog_debug, flog_warn, Error, Result};

static JSON_OBJECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

/// Prompts above this size are still sent, but logged.
const LARGE_PROMPT_BYTES: usize = 100 * 1024;

const REVIEW_INSTRUCTIONS: &str = "\
## Review Instructions

Your default verdict is APPROVE. Only use `request_changes` when there is a genuine blocking problem.

### Severity levels (use exactly one per comment)

- **error**: a blocking problem that MUST be fixed before merging. Reserve this for actual bugs \
or logic errors, missing handling of realistic failure modes, security issues, and missing test \
coverage for newly added logic.
- **warning**: a non-blocking issue worth fixing, such as an unlikely edge case or a moderate \
design concern with a clear improvement path.
- **suggestion**: a minor improvement or preference (naming, readability, optional refactors).

### Verdict rules
- Set verdict to `request_changes` ONLY if at least one comment has severity `error`.
- Otherwise set verdict to `approve`.

Respond with exactly this JSON structure:
{
  \"verdict\": \"approve\" | \"request_changes\",
  \"summary\": \"Overall assessment in 2-4 sentences.\",
  \"comments\": [
    {
      \"file\": \"relative/path/to/file\",
      \"line\": <line number as integer>,
      \"severity\": \"error\" | \"warning\" | \"suggestion\",
      \"comment\": \"What is wrong and how to fix it.\"
    }
  ]
}

If there are no issues, return an empty comments array and verdict \"approve\".";

#[derive(Debug, Deserialize)]
struct RawReview {
    verdict: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    comments: Vec<RawComment>,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    #[serde(default)]
    file: String,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    comment: String,
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening fence line.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Deserialize a JSON reply that may be bare, fenced, or embedded in prose.
pub(crate) fn parse_json_reply<T: DeserializeOwned>(text: &str) -> std::result::Result<T, String> {
    match serde_json::from_str(strip_fences(text)) {
        Ok(value) => Ok(value),
        Err(first) => {
            let embedded = JSON_OBJECT
                .find(text)
                .ok_or_else(|| format!("no JSON object found: {}", first))?;
            serde_json::from_str(embedded.as_str()).map_err(|e| e.to_string())
        }
    }
}

/// Parse an evaluator response into a [`Review`].
///
/// Accepts bare JSON, fenced JSON, or JSON embedded in prose. Unknown
/// severities degrade to suggestions; an unknown verdict is an error.
pub fn parse_review(text: &str) -> Result<Review> {
    let raw: RawReview = parse_json_reply(text).map_err(Error::ReviewParse)?;

    let claimed = match raw.verdict.trim().to_lowercase().as_str() {
        "approve" => Verdict::Approve,
        "request_changes" => Verdict::RequestChanges,
        other => return Err(Error::ReviewParse(format!("invalid verdict {:?}", other))),
    };

    let findings = raw
        .comments
        .into_iter()
        .map(|c| Finding {
            file: c.file,
            line: c.line,
            severity: Severity::parse(&c.severity),
            text: c.comment,
        })
        .collect();

    Ok(Review {
        claimed,
        summary: raw.summary,
        findings,
    })
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Error => "ERROR",
        Severity::Warning => "WARNING",
        Severity::Suggestion => "SUGGESTION",
    }
}

fn location(finding: &Finding) -> String {
    match finding.line {
        Some(line) => format!("{}:{}", finding.file, line),
        None => finding.file.clone(),
    }
}

/// Markdown posted on the change request after a review.
pub fn render_review_comment(review: &Review) -> String {
    let tag = match review.verdict() {
        Verdict::Approve => "[REVIEW: APPROVE]",
        Verdict::RequestChanges => "[REVIEW: REQUEST_CHANGES]",
    };
    let mut body = format!("## 🤖 Agent Review\n\n{}\n\n{}", tag, review.summary);
    if !review.findings.is_empty() {
        body.push_str("\n\n### Inline Comments\n");
        for finding in &review.findings {
            body.push_str(&format!(
                "\n- **[{}]** `{}`: {}",
                severity_label(finding.severity),
                location(finding),
                finding.text
            ));
        }
    }
    body
}

/// Review feedback formatted for a fixing agent.
pub fn render_feedback(review: &Review) -> String {
    let mut out = format!("Summary: {}\n", review.summary);
    for finding in &review.findings {
        out.push_str(&format!(
            "\n- [{}] {}: {}",
            severity_label(finding.severity),
            location(finding),
            finding.text
        ));
    }
    out
}

fn review_prompt(material: &ReviewMaterial) -> String {
    let contents = if material.contents.is_empty() {
        "(unavailable)".to_string()
    } else {
        material
            .contents
            .iter()
            .map(|(path, text)| format!("### {}\n```\n{}\n```", path, text))
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    format!(
        "You are a thorough but fair code reviewer. Review the following change request and \
         respond with ONLY a JSON object (no markdown fences, no prose before or after).\n\n\
         ## Title\n\n{}\n\n## Description\n\n{}\n\n## Diff\n\n{}\n\n\
         ## Changed Files (full content)\n\n{}\n\n{}",
        material.title, material.body, material.diff, contents, REVIEW_INSTRUCTIONS
    )
}

/// [`Evaluator`] backed by a code agent.
pub struct AgentReviewer {
    agent: Arc<dyn CodeAgent>,
    hosting: Arc<dyn Hosting>,
    cwd: PathBuf,
    model: String,
    timeout: Duration,
}

impl AgentReviewer {
    pub fn new(
        agent: Arc<dyn CodeAgent>,
        hosting: Arc<dyn Hosting>,
        cwd: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            agent,
            hosting,
            cwd,
            model: "sonnet".to_string(),
            timeout,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl Evaluator for AgentReviewer {
    async fn evaluate(&self, artifact: &Artifact) -> Result<Review> {
        flog!("Reviewing change request #{}", artifact.number);
        let material = self.hosting.review_material(artifact).await?;
        if material.diff.trim().is_empty() {
            return Err(Error::Execution(format!(
                "Change request #{} has an empty diff",
                artifact.number
            )));
        }

        let prompt = review_prompt(&material);
        if prompt.len() > LARGE_PROMPT_BYTES {
            flog_warn!(
                "Review prompt for #{} is {} KB",
                artifact.number,
                prompt.len() / 1024
            );
        }

        let run = self
            .agent
            .invoke(AgentRequest {
                prompt,
                cwd: self.cwd.clone(),
                model: self.model.clone(),
                max_turns: 1,
                allowed_tools: Vec::new(),
                timeout: self.timeout,
            })
            .await?;
        if !run.is_success() {
            return Err(Error::Execution(format!(
                "Reviewer exited with code {}: {}",
                run.exit_code,
                truncate(run.stderr.trim(), 500)
            )));
        }
        flog_debug!("Review response for #{}: {}", artifact.number, truncate(&run.output, 300));

        let review = parse_review(&run.output)?;
        if review.claimed != review.verdict() {
            flog_warn!(
                "Reviewer claimed {:?} for #{} but error count is {}; using {:?}",
                review.claimed,
                artifact.number,
                review.error_count(),
                review.verdict()
            );
        }

        self.hosting
            .comment(artifact, &render_review_comment(&review))
            .await?;
        flog!(
            "Review of #{}: {:?} ({} findings, {} errors)",
            artifact.number,
            review.verdict(),
            review.findings.len(),
            review.error_count()
        );
        Ok(review)
    }
}
