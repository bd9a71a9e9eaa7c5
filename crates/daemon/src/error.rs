use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = PreviewError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("invalid deck identifier '{0}'")]
    InvalidDeck(String),

    #[error("failed to fetch content for deck '{deck}': {reason}")]
    ContentFetchFailed { deck: String, reason: String },

    #[error("port allocation failed: {0}")]
    PortAllocationFailed(String),

    #[error("renderer for '{deck}' failed to start ({status})")]
    LaunchFailed {
        deck: String,
        status: String,
        stderr: String,
    },

    #[error("renderer for '{deck}' did not become ready within {timeout:?}")]
    LaunchTimeout { deck: String, timeout: Duration },

    #[error("failed to release port {port}: {reason}")]
    ReleaseFailed { port: u16, reason: String },

    #[error("deck artifact error: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("lease store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PreviewError {
    /// Diagnostic output from a failed renderer, when there is any.
    pub fn details(&self) -> Option<&str> {
        match self {
            PreviewError::LaunchFailed { stderr, .. } if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }
}
