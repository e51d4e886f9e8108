//! A session event: a name plus an optional opaque payload.

use serde::{Deserialize, Serialize};

/// A single server-originated event published to a client session.
///
/// The payload is opaque to the session layer; state machines typically
/// store pre-serialized bytes here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event name, used for listener dispatch on the receiving side.
    pub name: String,
    /// Optional opaque payload.
    pub payload: Option<Vec<u8>>,
}

impl Event {
    /// Create an event with no payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
        }
    }

    /// Create an event carrying a payload.
    pub fn with_payload(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload: Some(payload),
        }
    }
}
