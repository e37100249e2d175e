//! Error taxonomy shared across the pipeline.
//!
//! Transport failures (LLM unavailable, MCP transport lost) are caught at
//! the nearest semantic boundary and converted into degraded-mode behaviour
//! or a failure event; validation and not-found errors always surface to the
//! originating caller.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("conflict: {0}")]
    Conflict(String),

    /// Backpressure signal from the worker pool. Retryable by the caller.
    #[error("task queue is full")]
    QueueFull,

    #[error("{0} is unavailable")]
    Unavailable(&'static str),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// An MCP subprocess exited or closed its pipes; pending calls complete
    /// with this error and the session transitions to `closed`.
    #[error("mcp transport lost: {0}")]
    TransportLost(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("mcp server '{0}' is not ready")]
    ServerNotReady(String),

    #[error("tool call '{0}' timed out")]
    ToolTimeout(String),

    /// Bulk-action undo requested outside the allowed window.
    #[error("undo window expired for bulk action {0}")]
    UndoWindowExpired(Uuid),
}

impl Error {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Error::NotFound { kind, id }
    }

    /// True for errors a client may meaningfully retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::QueueFull)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::StorageUnavailable("row not found".to_string()),
            other => Error::StorageUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_is_retryable() {
        assert!(Error::QueueFull.is_retryable());
        assert!(!Error::Validation("empty".into()).is_retryable());
    }

    #[test]
    fn test_not_found_message_names_kind() {
        let id = Uuid::new_v4();
        let msg = Error::not_found("chunk", id).to_string();
        assert!(msg.contains("chunk"));
        assert!(msg.contains(&id.to_string()));
    }
}
