//! LeadPilot error taxonomy.
//!
//! Background automation never surfaces these to the lead; callers log them and
//! degrade to a no-op. `is_transient` decides what the retry layer may repeat.

use thiserror::Error;

/// Errors raised by LeadPilot components.
#[derive(Error, Debug)]
pub enum LeadPilotError {
    /// Lead, template, stage config or rule missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input such as an unknown routing operator.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Datastore read/write failure. Transient.
    #[error("Store error: {0}")]
    Store(String),

    /// Another worker changed the record first.
    #[error("Concurrency conflict: {0}")]
    Conflict(String),

    #[error("Config error: {0}")]
    Config(String),

    /// Template rendering failed (unresolved placeholder in strict mode).
    #[error("Template error: {0}")]
    Template(String),

    /// Outbound transport failure.
    #[error("Send error: {0}")]
    Send(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl LeadPilotError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Io(_))
    }

    /// Short machine-friendly kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::Store(_) => "store",
            Self::Conflict(_) => "conflict",
            Self::Config(_) => "config",
            Self::Template(_) => "template",
            Self::Send(_) => "send",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Other(_) => "other",
        }
    }
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, LeadPilotError>;
