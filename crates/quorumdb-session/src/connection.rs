//! Transport collaborator contracts.
//!
//! The session layer does not own a transport. It talks to whatever channel
//! the server's networking layer attaches through the [`Connection`] trait,
//! and falls back to the [`ConnectionRegistry`] when a linearizable event
//! must be delivered while no channel is attached.

use std::sync::Arc;

use async_trait::async_trait;
use quorumdb_commons::{PublishRequest, PublishResponse};

use crate::error::Result;

/// Opaque peer address, usable as a connection-registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Create an address from its string form.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The string form of the address.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handler invoked for publish requests arriving on a connection.
pub type PublishHandler = Arc<dyn Fn(PublishRequest) -> PublishResponse + Send + Sync>;

/// A bidirectional channel to a client, with request/response correlation.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send a publish request and await the peer's acknowledgement.
    async fn send_publish(&self, request: PublishRequest) -> Result<PublishResponse>;

    /// Install the handler for publish requests arriving on this connection.
    ///
    /// Replaces any previously installed handler.
    fn set_publish_handler(&self, handler: PublishHandler);
}

/// Lookup of connections by peer address.
///
/// Implemented by the server's connection pool. Used only on the
/// linearizable send path, when a session has a last-known address but no
/// attached connection.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Obtain a connection to the given address, establishing one if needed.
    async fn connection_to(&self, address: &Address) -> Result<Arc<dyn Connection>>;
}
