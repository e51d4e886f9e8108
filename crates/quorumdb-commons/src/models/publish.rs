//! Event-batch delivery messages.
//!
//! A `PublishRequest` carries one committed event batch from a server to the
//! client that owns the session. The `previous_index` lets the client detect
//! gaps in the per-session event stream and request a resend. The client
//! acknowledges receipt with a `PublishResponse` naming the highest event
//! index it has seen.

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::models::Event;

/// Status of a publish acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// The batch was accepted.
    Ok,
    /// The batch was rejected.
    Error,
}

/// One event batch pushed to a client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// The session the events belong to.
    pub session: SessionId,
    /// Log index at which the batch was produced.
    pub event_index: u64,
    /// Event index of the batch preceding this one, lifted to the client's
    /// acknowledged index when that is higher.
    pub previous_index: u64,
    /// The events, in publish order.
    pub events: Vec<Event>,
}

/// Acknowledgement of a [`PublishRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Whether the batch was accepted.
    pub status: ResponseStatus,
    /// The highest event index the responder has received in order.
    pub index: u64,
    /// Error payload for rejections that are not resend requests.
    pub error: Option<String>,
}

impl PublishResponse {
    /// Acknowledge receipt of all batches up to `index`.
    pub fn ok(index: u64) -> Self {
        Self {
            status: ResponseStatus::Ok,
            index,
            error: None,
        }
    }

    /// Reject the batch, telling the sender to resend everything after
    /// `index` (an error status with no error payload).
    pub fn resend_from(index: u64) -> Self {
        Self {
            status: ResponseStatus::Error,
            index,
            error: None,
        }
    }

    /// Reject the batch with an error payload.
    pub fn failed(index: u64, error: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            index,
            error: Some(error.into()),
        }
    }

    /// True when the batch was accepted.
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}
