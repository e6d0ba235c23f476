//! Error types for flowgate.
//!
//! Every handler failure surfaces to the caller through the `Display` of
//! one of these variants, so messages are written for the client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("{0}")]
    Validation(String),

    #[error("Illegal state {0} on Workitem, must be failed, successful, processing or retry")]
    InvalidState(String),

    #[error("Work item queue {0} is not empty, enable purge to delete")]
    NotEmpty(String),

    #[error("Failed purging workitemqueue {0}")]
    PurgeFailed(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Unknown command {0}")]
    UnknownCommand(String),

    #[error("timed out waiting for reply to {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a missing mandatory field.
    pub fn mandatory(field: &str) -> Self {
        Error::Validation(format!("{field} is mandatory"))
    }

    /// Short label used as a metric attribute.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::AccessDenied(_) => "access_denied",
            Error::Validation(_) => "validation",
            Error::InvalidState(_) => "invalid_state",
            Error::NotEmpty(_) => "not_empty",
            Error::PurgeFailed(_) => "purge_failed",
            Error::Unauthenticated(_) => "unauthenticated",
            Error::RateLimited => "rate_limited",
            Error::UnknownCommand(_) => "unknown_command",
            Error::Timeout(_) => "timeout",
            Error::Config(_) => "config",
            Error::Storage(_) => "storage",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
