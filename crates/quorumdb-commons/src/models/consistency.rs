//! Consistency level of a submitted command.

use serde::{Deserialize, Serialize};

/// Consistency level a client requested for a command.
///
/// The level controls how session events produced during the command's
/// application are delivered: linearizable events must reach the client
/// before the command's reply, sequential events ride the existing
/// connection and may lag it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Events are delivered before the command's reply.
    Linearizable,
    /// Events are delivered in order, piggybacked on the attached connection.
    Sequential,
}

impl ConsistencyLevel {
    /// Whether this level requires delivery before the command's reply.
    pub fn is_linearizable(&self) -> bool {
        matches!(self, ConsistencyLevel::Linearizable)
    }
}
