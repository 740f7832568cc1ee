//! Turning remote work items (issues) into tasks.
//!
//! Issue bodies may carry optional sections, matched case-insensitively:
//!
//! ```text
//! Files:
//! - src/foo.rs
//! - tests/foo.rs
//!
//! Depends on: #1, #2
//! Max turns: 40
//! ```
//!
//! A `priority:N` label sets the priority.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::task::{normalize_path, Task, TaskId};

/// An open work item as returned by the hosting service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

static FILES_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*(?:#{1,3}\s+)?files\s*:?\s*$").unwrap());

static FILES_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*[-*]\s+(.+)$").unwrap());

static DEPENDS_ON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:#{1,3}\s+)?depends\s+on\s*:?\s*(.+)").unwrap());

static DEPENDS_REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\d+)").unwrap());

static MAX_TURNS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:#{1,3}\s+)?max\s+turns\s*:?\s*(\d+)").unwrap());

static PRIORITY_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^priority:(\d+)$").unwrap());

/// Extensions that mark a `Files:` entry as a path.
static KNOWN_EXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\.(py|js|ts|jsx|tsx|json|yaml|yml|toml|md|txt|sh|cfg|ini|html|css|sql|go|rs|java|c|cpp|h|rb|php|env|lock|tf|proto|graphql|vue|svelte)$",
    )
    .unwrap()
});

/// Whether a `Files:` entry looks like a path rather than a code symbol
/// such as `self.state` or `config.Builder`.
fn is_file_path(entry: &str) -> bool {
    !entry.is_empty() && (entry.contains('/') || KNOWN_EXT_RE.is_match(entry))
}

/// Whether the body carries a `Files:` header at all.
pub fn has_files_section(body: &str) -> bool {
    FILES_HEADER_RE.is_match(body)
}

/// Entries of the `Files:` bullet list, up to the first blank line or
/// non-bullet line after at least one item.
pub fn parse_files(body: &str) -> Vec<String> {
    let Some(header) = FILES_HEADER_RE.find(body) else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    for line in body[header.end()..].lines() {
        if line.trim().is_empty() {
            if entries.is_empty() {
                continue;
            }
            break;
        }
        match FILES_ITEM_RE.captures(line) {
            Some(caps) => entries.push(caps[1].trim().trim_matches('`').to_string()),
            None => break,
        }
    }
    entries
        .into_iter()
        .filter(|e| is_file_path(e))
        .map(|e| normalize_path(&e))
        .collect()
}

/// `Depends on: #N` references, kept only when `N` is in `known`.
pub fn parse_depends_on(body: &str, known: &HashSet<u64>) -> Vec<TaskId> {
    let Some(caps) = DEPENDS_ON_RE.captures(body) else {
        return Vec::new();
    };
    DEPENDS_REF_RE
        .captures_iter(&caps[1])
        .filter_map(|c| c[1].parse::<u64>().ok())
        .filter(|n| known.contains(n))
        .map(|n| TaskId::new(format!("issue-{}", n)))
        .collect()
}

pub fn parse_max_turns(body: &str) -> u32 {
    MAX_TURNS_RE
        .captures(body)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(50)
}

pub fn parse_priority(labels: &[String]) -> u32 {
    labels
        .iter()
        .find_map(|l| PRIORITY_LABEL_RE.captures(l).and_then(|c| c[1].parse().ok()))
        .unwrap_or(1)
}

/// Convert work items into tasks, sorted by ascending priority.
///
/// Dependencies on items outside `items` are dropped.
pub fn tasks_from_items(items: &[WorkItem]) -> Vec<Task> {
    let known: HashSet<u64> = items.iter().map(|i| i.number).collect();
    let mut tasks: Vec<Task> = items
        .iter()
        .map(|item| Task {
            id: TaskId::new(format!("issue-{}", item.number)),
            title: item.title.clone(),
            description: item.body.clone(),
            files_touched: parse_files(&item.body),
            depends_on: parse_depends_on(&item.body, &known),
            priority: parse_priority(&item.labels),
            max_turns: parse_max_turns(&item.body),
            model: "sonnet".to_string(),
        })
        .collect();
    tasks.sort_by_key(|t| t.priority);
    tasks
}
