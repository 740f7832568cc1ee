//! Follow-up issues for non-blocking review findings.
//!
//! After a change request lands, warnings and suggestions from its last
//! review are filed as new work items so they are not lost. Everything here
//! is best effort: failures are logged and never affect the landed change.

use crate::core::Artifact;
use crate::ports::{Finding, Hosting, NewIssue, Review, Severity};
use crate::{flog, flog_debug, flog_warn, Result};

pub const FOLLOWUP_LABEL: &str = "review-followup";
const PRIORITY_LABEL: &str = "priority:3";
const TITLE_PREFIX: &str = "[Review Follow-up]";
const MIN_TEXT_CHARS: usize = 20;
const MAX_TITLE_CHARS: usize = 80;

/// Warnings and suggestions with enough text to act on.
pub fn followup_candidates(review: &Review) -> Vec<&Finding> {
    review
        .findings
        .iter()
        .filter(|f| matches!(f.severity, Severity::Warning | Severity::Suggestion))
        .filter(|f| f.text.trim().chars().count() >= MIN_TEXT_CHARS)
        .collect()
}

fn first_sentence(text: &str) -> &str {
    let text = text.trim();
    text.split_once(". ")
        .map(|(head, _)| head)
        .unwrap_or(text)
        .trim_end_matches('.')
}

pub fn followup_title(finding: &Finding) -> String {
    let title = format!(
        "{} {}: {}",
        TITLE_PREFIX,
        finding.file,
        first_sentence(&finding.text)
    );
    if title.chars().count() > MAX_TITLE_CHARS {
        let cut: String = title.chars().take(MAX_TITLE_CHARS - 3).collect();
        format!("{}...", cut)
    } else {
        title
    }
}

fn followup_body(finding: &Finding, artifact: &Artifact) -> String {
    let location = match finding.line {
        Some(line) => format!("{}:{}", finding.file, line),
        None => finding.file.clone(),
    };
    let severity = match finding.severity {
        Severity::Error => "ERROR",
        Severity::Warning => "WARNING",
        Severity::Suggestion => "SUGGESTION",
    };
    format!(
        "### Description\n\nReview feedback from change request #{} ({}):\n\n\
         **Severity:** {}\n**File:** `{}`\n**Original comment:**\n> {}\n\n\
         **What to fix:** {}.\n\n### Files\n\n- {}\n\n### Max turns\n\n20\n",
        artifact.number,
        artifact.url,
        severity,
        location,
        finding.text.trim(),
        first_sentence(&finding.text),
        finding.file
    )
}

/// File follow-up issues for `review` and summarize them on the change
/// request. Returns the created issue URLs.
pub async fn create_followups(
    hosting: &dyn Hosting,
    artifact: &Artifact,
    review: &Review,
    ready_label: &str,
) -> Vec<String> {
    let candidates = followup_candidates(review);
    if candidates.is_empty() {
        return Vec::new();
    }
    match file_followups(hosting, artifact, &candidates, ready_label).await {
        Ok(urls) => urls,
        Err(e) => {
            flog_warn!("Error creating follow-ups for #{}: {}", artifact.number, e);
            Vec::new()
        }
    }
}

async fn file_followups(
    hosting: &dyn Hosting,
    artifact: &Artifact,
    candidates: &[&Finding],
    ready_label: &str,
) -> Result<Vec<String>> {
    let mut existing = hosting.open_issue_titles().await?;
    let mut labels = vec![ready_label.to_string(), FOLLOWUP_LABEL.to_string()];
    if hosting.label_exists(PRIORITY_LABEL).await.unwrap_or(false) {
        labels.push(PRIORITY_LABEL.to_string());
    }

    let mut urls = Vec::new();
    for finding in candidates {
        let title = followup_title(finding);
        if existing.contains(&title) {
            flog_debug!("Skipping duplicate follow-up: {}", title);
            continue;
        }
        let issue = NewIssue {
            title: title.clone(),
            body: followup_body(finding, artifact),
            labels: labels.clone(),
        };
        match hosting.create_issue(&issue).await {
            Ok(url) => {
                flog!("Created follow-up issue: {}", url);
                existing.push(title);
                urls.push(url);
            }
            Err(e) => flog_warn!("Failed to create follow-up for {}: {}", finding.file, e),
        }
    }

    if !urls.is_empty() {
        let items = urls
            .iter()
            .map(|u| format!("- {}", u))
            .collect::<Vec<_>>()
            .join("\n");
        let body = format!(
            "## Review Follow-up Issues Created\n\n\
             The following issues were created from review warnings and suggestions:\n\n{}",
            items
        );
        if let Err(e) = hosting.comment(artifact, &body).await {
            flog_warn!("Failed to post follow-up summary on #{}: {}", artifact.number, e);
        }
    }
    Ok(urls)
}
