use std::path::PathBuf;

use thiserror::Error;

/// Malformed story structure. Skips the story, never the cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("<ap> opened at byte {0} is never closed")]
    Unclosed(usize),

    #[error("<ap> opened at byte {0} inside another <ap>")]
    Nested(usize),

    #[error("stray </ap> at byte {0}")]
    StrayClose(usize),
}

/// Failure to turn a post id into media items. Recorded against the entry
/// as a retryable failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("post not found: {0}")]
    NotFound(String),

    #[error("api error: {0}")]
    Api(String),
}

impl From<x_client::XError> for ResolutionError {
    fn from(err: x_client::XError) -> Self {
        match err {
            x_client::XError::RateLimited { reset_at } => {
                ResolutionError::RateLimited(format!("api returned 429, reset at {reset_at:?}"))
            }
            x_client::XError::NotFound(id) => ResolutionError::NotFound(id),
            other => ResolutionError::Api(other.to_string()),
        }
    }
}

/// Per-item download failure. Siblings are unaffected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    /// Network failure, 5xx or 429: worth another attempt.
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    /// Local filesystem failure while writing the item.
    #[error("io: {0}")]
    Io(String),
}

impl DownloadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DownloadError::Transient(_))
    }
}

/// State or manifest could not be written. Fatal to the cycle; the last
/// committed file stays intact.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state file {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Every removal strategy failed for a path. Retried on the next reap.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot remove {}: {}", .path.display(), .attempts.join("; "))]
pub struct CleanupError {
    pub path: PathBuf,
    pub attempts: Vec<String>,
}

/// Errors that abort a whole cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
