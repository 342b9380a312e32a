//! Sync error handling
//!
//! Provides the typed error taxonomy for the sync engine. Transport, auth,
//! and timeout errors are absorbed by the supervisor and consumer and only
//! surface as status notifications; protocol violations propagate.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the sync engine
#[derive(Error, Debug)]
pub enum SyncError {
    /// Connection-level failure (socket error, server unreachable)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The session token is no longer accepted by the server
    #[error("Authentication expired")]
    AuthExpired,

    /// A change-application pass exceeded its wall-clock budget
    #[error("Applying change batch exceeded the {budget:?} budget (change ids {change_ids:?})")]
    ProcessingTimeout {
        budget: Duration,
        change_ids: Vec<i64>,
    },

    /// Entity does not exist on the server (HTTP 404)
    #[error("Not found: {entity} '{id}'")]
    NotFound { entity: String, id: String },

    /// Malformed or unexpected message content. Fatal, never swallowed.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Server answered with an unexpected HTTP status
    #[error("Server returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

impl SyncError {
    /// Whether the supervisor should handle this error by reconnecting
    /// rather than propagating it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::ProcessingTimeout { .. } | SyncError::Http { .. }
        )
    }

    /// Classify an HTTP status code from the server collaborator.
    pub fn from_status(status: u16, entity: &str, id: &str, message: String) -> Self {
        match status {
            401 => SyncError::AuthExpired,
            404 => SyncError::NotFound {
                entity: entity.to_string(),
                id: id.to_string(),
            },
            _ => SyncError::Http { status, message },
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        SyncError::Transport(error.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Protocol(error.to_string())
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
