use thiserror::Error;

pub type Result<T> = std::result::Result<T, InewsError>;

#[derive(Debug, Error)]
pub enum InewsError {
    /// Server unreachable, refused, timed out or rejected the login.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A story could not be retrieved or decoded.
    #[error("Transfer error for {name}: {message}")]
    Transfer { name: String, message: String },

    /// The server rejected a directory change.
    #[error("Cannot navigate to {path}: {message}")]
    Path { path: String, message: String },
}

impl InewsError {
    /// Only connection-level failures are worth retrying within a cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, InewsError::Connection(_))
    }
}
