//! Lock client error types.

use thiserror::Error;

/// Errors from lock and results service calls.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid uri {uri}: {message}")]
    InvalidUri { uri: String, message: String },

    #[error("request to {uri} failed: {message}")]
    Http { uri: String, message: String },

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("{uri} returned HTTP {status}")]
    Status { uri: String, status: u16 },

    #[error("could not decode response from {uri}: {source}")]
    Decode {
        uri: String,
        #[source]
        source: serde_json::Error,
    },
}

impl LockError {
    /// Whether the server could not be reached at all (as opposed to
    /// answering with something we did not like).
    pub fn is_connection(&self) -> bool {
        matches!(self, LockError::Http { .. } | LockError::Timeout(_))
    }
}

pub type LockResult<T> = Result<T, LockError>;
