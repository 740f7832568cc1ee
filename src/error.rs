use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid plan: {0}")]
    Plan(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Label not found: {0}")]
    LabelMissing(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Execution(String),

    #[error("Review response could not be parsed: {0}")]
    ReviewParse(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Worker pool is closed")]
    PoolClosed,

    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether retrying the same call could plausibly succeed.
    ///
    /// Definitive answers from a remote service (already exists, missing
    /// label, not found, bad credentials) are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) | Error::Timeout(_) | Error::Io(_) => true,
            Error::Command { message, .. } => classify_message(message) == Class::Transient,
            _ => false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Class {
    Transient,
    Definitive,
}

fn classify_message(message: &str) -> Class {
    let lower = message.to_lowercase();
    const DEFINITIVE: &[&str] = &[
        "already exists",
        "not found",
        "could not resolve",
        "authentication",
        "permission denied",
        "http 401",
        "http 403",
        "http 404",
        "http 422",
    ];
    if DEFINITIVE.iter().any(|needle| lower.contains(needle)) {
        Class::Definitive
    } else {
        Class::Transient
    }
}

/// Map a failed external command's stderr onto the most specific variant.
pub fn classify_command_failure(command: &str, stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();
    if lower.contains("already exists") {
        Error::AlreadyExists(message)
    } else if lower.contains("label") && lower.contains("not found") {
        Error::LabelMissing(message)
    } else if lower.contains("not found") || lower.contains("could not resolve") {
        Error::NotFound(message)
    } else if lower.contains("authentication") || lower.contains("http 401") {
        Error::Auth(message)
    } else if lower.contains("rate limit") || lower.contains("429") || lower.contains("timed out") {
        Error::Transient(message)
    } else {
        Error::Command {
            command: command.to_string(),
            message,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
