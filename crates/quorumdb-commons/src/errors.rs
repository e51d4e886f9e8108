//! Error types shared across QuorumDB crates.

use thiserror::Error;

/// Result type for commons operations.
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors produced by the shared foundation layer.
#[derive(Debug, Error)]
pub enum CommonError {
    /// Failed to serialize or deserialize a payload
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A value failed validation
    #[error("Validation error: {0}")]
    Validation(String),
}

impl CommonError {
    /// Create a Serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        CommonError::Serialization(msg.into())
    }

    /// Create a Validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        CommonError::Validation(msg.into())
    }
}
