//! Event batches and their delivery bookkeeping.
//!
//! Events published while a single log entry is applied are accumulated
//! into one [`EventBatch`]. Committing the entry seals the batch, queues it
//! for delivery, and hands the caller a [`DeliveryReceipt`] that resolves
//! when the client acknowledges the batch.

use std::sync::Arc;

use quorumdb_commons::{Event, PublishRequest, SessionId};
use tokio::sync::oneshot;

use crate::connection::{Address, Connection, ConnectionRegistry};

/// Resolves when the client acknowledges the batch.
///
/// Receiving `Ok(())` means the batch was acknowledged (or the session
/// expired and waiters were released); a receive error means the session
/// was dropped without either happening.
pub type DeliveryReceipt = oneshot::Receiver<()>;

/// A batch of events produced while applying one log entry.
pub struct EventBatch {
    event_index: u64,
    previous_index: u64,
    events: Vec<Event>,
    acked_tx: Option<oneshot::Sender<()>>,
    receipt: Option<oneshot::Receiver<()>>,
}

impl EventBatch {
    /// Start a batch at `event_index`, recording the index of the batch
    /// produced before it (0 if none).
    pub(crate) fn new(event_index: u64, previous_index: u64) -> Self {
        let (acked_tx, receipt) = oneshot::channel();
        Self {
            event_index,
            previous_index,
            events: Vec::new(),
            acked_tx: Some(acked_tx),
            receipt: Some(receipt),
        }
    }

    /// Log index at which the batch was produced.
    pub fn event_index(&self) -> u64 {
        self.event_index
    }

    /// Event index of the immediately preceding batch.
    pub fn previous_index(&self) -> u64 {
        self.previous_index
    }

    /// The accumulated events, in publish order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub(crate) fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Take the receipt the committer awaits. Yields once per batch.
    pub(crate) fn take_receipt(&mut self) -> Option<DeliveryReceipt> {
        self.receipt.take()
    }

    /// Resolve the batch's receipt. Safe to call more than once.
    pub(crate) fn acknowledge(&mut self) {
        if let Some(tx) = self.acked_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Build the wire request for this batch.
    ///
    /// The previous index is lifted to `complete_index` because the client
    /// needs no older continuity than its own acknowledgement.
    pub(crate) fn to_request(&self, session: SessionId, complete_index: u64) -> PublishRequest {
        PublishRequest {
            session,
            event_index: self.event_index,
            previous_index: self.previous_index.max(complete_index),
            events: self.events.clone(),
        }
    }
}

impl std::fmt::Debug for EventBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBatch")
            .field("event_index", &self.event_index)
            .field("previous_index", &self.previous_index)
            .field("events", &self.events.len())
            .finish()
    }
}

/// Where an outbound batch should be sent.
pub(crate) enum SendTarget {
    /// Send on the connection currently attached to the session.
    Attached(Arc<dyn Connection>),
    /// Look the peer up by address first (linearizable fallback path).
    Lookup(Arc<dyn ConnectionRegistry>, Address),
}

/// A fully composed outbound send, ready for the async boundary.
pub(crate) struct EventSend {
    pub(crate) target: SendTarget,
    pub(crate) request: PublishRequest,
}
