//! The client session handle.
//!
//! `ClientSession` wraps the replicated [`SessionState`] core behind a
//! shared handle. It exposes two surfaces:
//!
//! - the **client-facing** surface used by state machine code during
//!   command application: `publish`, the listener registrations, and the
//!   lifecycle predicates;
//! - the **executor-facing** surface the state machine executor drives as
//!   it applies log entries: counter advancement, deferred registration,
//!   the response cache, commit, and the lifecycle transitions.
//!
//! The handle also owns the session's only asynchronous boundary: event
//! sends are spawned onto the runtime, and their acknowledgements are
//! re-applied to the core when the peer replies. Everything else runs
//! inline under the session's write lock.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use quorumdb_commons::{PublishRequest, PublishResponse, SessionId};

use crate::connection::{Address, Connection};
use crate::context::StateMachineContext;
use crate::error::Result;
use crate::events::{DeliveryReceipt, EventSend, SendTarget};
use crate::listeners::{ListenerHandle, Listeners};
use crate::state::{DeferredOp, ResponseSignal, SessionState};

/// Callback receiving an event payload.
pub type EventCallback = dyn Fn(Option<&[u8]>) + Send + Sync;

/// Callback observing a session lifecycle transition.
pub type SessionCallback = dyn Fn(&ClientSession) + Send + Sync;

struct SessionShared {
    id: SessionId,
    state: RwLock<SessionState>,
    event_listeners: DashMap<String, Listeners<EventCallback>>,
    open_listeners: Listeners<SessionCallback>,
    close_listeners: Listeners<SessionCallback>,
}

/// Per-client session, replicated on every server.
///
/// Cloning is cheap and yields a handle to the same session.
#[derive(Clone)]
pub struct ClientSession {
    shared: Arc<SessionShared>,
}

impl ClientSession {
    /// Create the session registered at log index `id`.
    ///
    /// The session starts closed; the registrar calls [`open`](Self::open)
    /// once the registration is visible.
    pub fn new(id: SessionId, timeout: Duration, context: &Arc<StateMachineContext>) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                id,
                state: RwLock::new(SessionState::new(id, timeout, context)),
                event_listeners: DashMap::new(),
                open_listeners: Listeners::new(),
                close_listeners: Listeners::new(),
            }),
        }
    }

    /// The session identifier.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// The session's inactivity timeout.
    pub fn timeout(&self) -> Duration {
        self.shared.state.read().timeout()
    }

    // ===== Client-facing surface =====

    /// Publish an event to the client that owns this session.
    ///
    /// Only valid while a command is being applied; the event is delivered
    /// with the same consistency as that command.
    pub fn publish(&self, name: &str, payload: Option<Vec<u8>>) -> Result<()> {
        self.shared.state.write().publish(name, payload)
    }

    /// Listen for events with the given name arriving on this session's
    /// inbound path.
    pub fn on_event(
        &self,
        name: &str,
        listener: impl Fn(Option<&[u8]>) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.shared
            .event_listeners
            .entry(name.to_string())
            .or_default()
            .add(Arc::new(listener))
    }

    /// Observe session opens. Observers are notified by the registrar, not
    /// by the session itself.
    pub fn on_open(
        &self,
        listener: impl Fn(&ClientSession) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.shared.open_listeners.add(Arc::new(listener))
    }

    /// Observe session closes.
    ///
    /// If the session is already closed, the listener is invoked
    /// immediately with this session.
    pub fn on_close(
        &self,
        listener: impl Fn(&ClientSession) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let callback: Arc<SessionCallback> = Arc::new(listener);
        let handle = self.shared.close_listeners.add(callback.clone());
        if self.is_closed() {
            self.invoke_session_callback(&callback);
        }
        handle
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.read().is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.read().is_closed()
    }

    pub fn is_expired(&self) -> bool {
        self.shared.state.read().is_expired()
    }

    // ===== Sequencing =====

    pub fn request_sequence(&self) -> u64 {
        self.shared.state.read().request_sequence()
    }

    pub fn next_request_sequence(&self) -> u64 {
        self.shared.state.read().next_request_sequence()
    }

    pub fn command_sequence(&self) -> u64 {
        self.shared.state.read().command_sequence()
    }

    pub fn next_command_sequence(&self) -> u64 {
        self.shared.state.read().next_command_sequence()
    }

    pub fn last_applied(&self) -> u64 {
        self.shared.state.read().last_applied()
    }

    /// Park a submission until its sequence number comes up.
    pub fn register_request(&self, sequence: u64, op: DeferredOp) {
        self.shared.state.write().register_request(sequence, op);
    }

    /// Park a causal query until the command sequence reaches `sequence`.
    pub fn register_sequence_query(&self, sequence: u64, op: DeferredOp) {
        self.shared
            .state
            .write()
            .register_sequence_query(sequence, op);
    }

    /// Park a query until the applied log index reaches `index`.
    pub fn register_index_query(&self, index: u64, op: DeferredOp) {
        self.shared.state.write().register_index_query(index, op);
    }

    /// Record that requests up to `request` have been accepted.
    pub fn set_request_sequence(&self, request: u64) {
        self.shared.state.write().set_request_sequence(request);
    }

    /// Advance the command sequence, releasing gated queries and
    /// submissions along the way.
    pub fn set_command_sequence(&self, sequence: u64) {
        self.shared.state.write().set_command_sequence(sequence);
    }

    /// Advance the applied log index, releasing gated index queries.
    pub fn set_last_applied(&self, index: u64) {
        self.shared.state.write().set_last_applied(index);
    }

    // ===== Response cache =====

    /// Cache a command's output for at-least-once retries.
    pub fn register_response(
        &self,
        sequence: u64,
        response: Vec<u8>,
        signal: Option<ResponseSignal>,
    ) {
        self.shared
            .state
            .write()
            .register_response(sequence, response, signal);
    }

    /// Cached output for `sequence`, if still addressable.
    pub fn response(&self, sequence: u64) -> Option<Vec<u8>> {
        self.shared.state.read().response(sequence).map(<[u8]>::to_vec)
    }

    /// Completion signal a duplicate submission can chain on.
    pub fn response_signal(&self, sequence: u64) -> Option<ResponseSignal> {
        self.shared.state.read().response_signal(sequence)
    }

    /// Drop cached responses up to `sequence`.
    pub fn clear_responses(&self, sequence: u64) {
        self.shared.state.write().clear_responses(sequence);
    }

    pub fn command_low_water_mark(&self) -> u64 {
        self.shared.state.read().command_low_water_mark()
    }

    // ===== Event pipeline =====

    pub fn event_index(&self) -> u64 {
        self.shared.state.read().event_index()
    }

    pub fn complete_index(&self) -> u64 {
        self.shared.state.read().complete_index()
    }

    /// Index the keep-alive path reports as completed for this session.
    pub fn last_completed(&self) -> u64 {
        self.shared.state.read().last_completed()
    }

    /// Seal and queue the event batch produced at `index`, initiating its
    /// send per the command's consistency.
    ///
    /// Returns the batch's delivery receipt so the executor can await the
    /// acknowledgement when the command's consistency requires it; `None`
    /// when no events were published at this index.
    pub fn commit(&self, index: u64) -> Option<DeliveryReceipt> {
        let (receipt, send) = self.shared.state.write().commit(index);
        if let Some(send) = send {
            self.dispatch_send(send);
        }
        receipt
    }

    /// Acknowledge batches up to `index` and re-send the rest on the
    /// attached connection. Driven by the reconnect path and by peers that
    /// nack with their last-seen index.
    pub fn resend_events(&self, index: u64) {
        let sends = self.shared.state.write().resend_events(index);
        for send in sends {
            self.dispatch_send(send);
        }
    }

    /// Apply a publish acknowledgement received from the client.
    pub fn handle_publish_response(&self, response: PublishResponse) {
        let sends = self.shared.state.write().handle_publish_response(response);
        for send in sends {
            self.dispatch_send(send);
        }
    }

    /// Dispatch inbound events to this session's listeners.
    ///
    /// This is the handler installed on attached connections; it also
    /// serves server-local consumers that subscribe to their own session's
    /// events. Always acknowledges.
    pub fn handle_publish(&self, request: PublishRequest) -> PublishResponse {
        for event in &request.events {
            let callbacks = match self.shared.event_listeners.get(&event.name) {
                Some(listeners) => listeners.snapshot(),
                None => continue,
            };
            for callback in callbacks {
                let payload = event.payload.as_deref();
                if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                    log::warn!(
                        "session {}: listener for event '{}' panicked",
                        self.shared.id,
                        event.name
                    );
                }
            }
        }
        PublishResponse::ok(request.event_index)
    }

    // ===== Connection and address =====

    /// Attach a transport channel and install the inbound publish handler
    /// on it.
    pub fn set_connection(&self, connection: Arc<dyn Connection>) {
        let weak = Arc::downgrade(&self.shared);
        connection.set_publish_handler(Arc::new(move |request| match weak.upgrade() {
            Some(shared) => ClientSession { shared }.handle_publish(request),
            None => PublishResponse::ok(request.event_index),
        }));
        self.shared.state.write().set_connection(Some(connection));
    }

    /// Detach the transport channel; queued batches wait for a reconnect.
    pub fn clear_connection(&self) {
        self.shared.state.write().set_connection(None);
    }

    /// The currently attached transport channel, if any.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.shared.state.read().connection().cloned()
    }

    /// Record the client's last-known address, used as the linearizable
    /// send fallback.
    pub fn set_address(&self, address: Address) {
        self.shared.state.write().set_address(address);
    }

    pub fn address(&self) -> Option<Address> {
        self.shared.state.read().address().cloned()
    }

    // ===== Lifecycle =====

    /// Mark the session open. Open observers are the registrar's to notify.
    pub fn open(&self) {
        self.shared.state.write().open();
    }

    /// Close the session and notify close observers.
    pub fn close(&self) {
        self.shared.state.write().close();
        self.notify_close_listeners();
    }

    /// Expire the session: close it, release every waiter parked on a
    /// queued batch, and notify close observers.
    pub fn expire(&self) {
        self.shared.state.write().expire();
        self.notify_close_listeners();
    }

    /// Advisory flag set by the failure detector.
    pub fn suspect(&self) {
        self.shared.state.write().suspect();
    }

    /// Clear the failure detector's advisory flag.
    pub fn trust(&self) {
        self.shared.state.write().trust();
    }

    pub fn is_suspect(&self) -> bool {
        self.shared.state.read().is_suspect()
    }

    /// Latch the graceful-unregister flag so the replicator can tell a
    /// deliberate close from an expiration.
    pub fn unregister(&self) {
        self.shared.state.write().unregister();
    }

    pub fn is_unregistering(&self) -> bool {
        self.shared.state.read().is_unregistering()
    }

    // ===== Bookkeeping for external collaborators =====

    pub fn timestamp(&self) -> u64 {
        self.shared.state.read().timestamp()
    }

    /// Raise the observed log timestamp. Never retreats.
    pub fn set_timestamp(&self, timestamp: u64) {
        self.shared.state.write().set_timestamp(timestamp);
    }

    pub fn connect_index(&self) -> u64 {
        self.shared.state.read().connect_index()
    }

    pub fn set_connect_index(&self, index: u64) {
        self.shared.state.write().set_connect_index(index);
    }

    pub fn keep_alive_index(&self) -> u64 {
        self.shared.state.read().keep_alive_index()
    }

    pub fn set_keep_alive_index(&self, index: u64) {
        self.shared.state.write().set_keep_alive_index(index);
    }

    // ===== Send plumbing =====

    fn dispatch_send(&self, send: EventSend) {
        tokio::spawn(Self::run_send(self.clone(), send));
    }

    async fn run_send(session: ClientSession, send: EventSend) {
        let EventSend { target, request } = send;
        let connection = match target {
            SendTarget::Attached(connection) => connection,
            SendTarget::Lookup(registry, address) => {
                match registry.connection_to(&address).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        log::debug!(
                            "session {}: connection lookup for {} failed: {}",
                            request.session,
                            address,
                            e
                        );
                        return;
                    }
                }
            }
        };

        log::debug!(
            "session {}: sending event batch at index {} (previous {})",
            request.session,
            request.event_index,
            request.previous_index
        );
        match connection.send_publish(request).await {
            Ok(response) => session.handle_publish_response(response),
            Err(e) => {
                // The batch stays queued; the reconnect path resends it.
                log::debug!("session {}: event send failed: {}", session.id(), e);
            }
        }
    }

    fn notify_close_listeners(&self) {
        for callback in self.shared.close_listeners.snapshot() {
            self.invoke_session_callback(&callback);
        }
    }

    fn invoke_session_callback(&self, callback: &Arc<SessionCallback>) {
        if catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
            log::warn!("session {}: lifecycle listener panicked", self.shared.id);
        }
    }
}

impl PartialEq for ClientSession {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for ClientSession {}

impl std::hash::Hash for ClientSession {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientSession[id={}]", self.shared.id)
    }
}
