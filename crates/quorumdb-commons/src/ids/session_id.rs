//! SessionId - globally unique client session identifier.
//!
//! A session identifier is assigned when a register-client entry is applied
//! to the replicated log. The identifier is the log index of that entry, so
//! it is globally unique and totally ordered with respect to every other
//! log index.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a registered client session.
///
/// The raw value is the log index at which the session was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a SessionId from the registration log index.
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    /// Get the raw u64 value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The log index at which this session was registered.
    ///
    /// Identical to [`as_u64`](Self::as_u64); named for call sites that care
    /// about the index semantics rather than the identity semantics.
    pub fn registration_index(&self) -> u64 {
        self.0
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
