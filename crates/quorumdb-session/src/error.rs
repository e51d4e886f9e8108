//! Error types for the session layer.

use quorumdb_commons::SessionId;
use thiserror::Error;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors that can occur in the session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation attempted outside its valid state, e.g. publishing an event
    /// when no command is being applied
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The session has been closed
    #[error("Session {0} is closed")]
    Closed(SessionId),

    /// The session has expired
    #[error("Session {0} is expired")]
    Expired(SessionId),

    /// An acknowledgement for an index the client already confirmed
    #[error("Stale acknowledgement: index {index} is not past complete index {complete_index}")]
    StaleAck { index: u64, complete_index: u64 },

    /// Peer rejected a batch and named its last-seen index
    #[error("Peer requested resend from index {index}")]
    Nack { index: u64 },

    /// Connection failed while sending
    #[error("Transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// Create an InvalidState error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        SessionError::InvalidState(msg.into())
    }

    /// Create a Transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        SessionError::Transport(msg.into())
    }

    /// Returns true if retrying might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Transport(_) | SessionError::Nack { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SessionError::transport("connection reset").is_retryable());
        assert!(SessionError::Nack { index: 3 }.is_retryable());
        assert!(!SessionError::Closed(SessionId::new(1)).is_retryable());
        assert!(!SessionError::invalid_state("no command").is_retryable());
    }
}
