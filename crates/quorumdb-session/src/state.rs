//! The single-writer session core.
//!
//! `SessionState` holds everything the replicated log projects onto one
//! client session: the sequence/index counters, the deferred submission and
//! query maps, the response cache, the event batch being accumulated, and
//! the outbound event queue. Every server in the cluster derives identical
//! state for a session by replaying the same log.
//!
//! All methods here are synchronous and run under the session's write lock;
//! the async send boundary lives in [`crate::session`]. Deferred operations
//! receive `&mut SessionState` when they fire, so a released submission can
//! advance the very counters that released it without re-locking.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use quorumdb_commons::{ConsistencyLevel, Event, PublishRequest, PublishResponse, ResponseStatus, SessionId};
use tokio::sync::watch;

use crate::connection::{Address, Connection};
use crate::context::StateMachineContext;
use crate::error::{Result, SessionError};
use crate::events::{DeliveryReceipt, EventBatch, EventSend, SendTarget};

/// An operation parked until the session reaches a sequence or index.
pub type DeferredOp = Box<dyn FnOnce(&mut SessionState) + Send + Sync>;

/// Completion signal a submitter waits on for a cached command.
///
/// The submitter's side creates the channel and flips the value to `true`
/// when the command's reply has been sent; the session only stores the
/// receiver so duplicate submissions can chain onto it.
pub type ResponseSignal = watch::Receiver<bool>;

/// Replicated per-client session state.
pub struct SessionState {
    id: SessionId,
    timeout: Duration,
    context: Weak<StateMachineContext>,
    connection: Option<Arc<dyn Connection>>,
    address: Option<Address>,

    connect_index: u64,
    keep_alive_index: u64,
    request_sequence: u64,
    command_sequence: u64,
    last_applied: u64,
    command_low_water_mark: u64,
    event_index: u64,
    complete_index: u64,
    timestamp: u64,

    commands: HashMap<u64, DeferredOp>,
    sequence_queries: HashMap<u64, Vec<DeferredOp>>,
    index_queries: HashMap<u64, Vec<DeferredOp>>,

    responses: HashMap<u64, Vec<u8>>,
    signals: HashMap<u64, ResponseSignal>,

    events: VecDeque<EventBatch>,
    open_batch: Option<EventBatch>,

    suspect: bool,
    unregistering: bool,
    expired: bool,
    closed: bool,
}

impl SessionState {
    /// Create the state for a session registered at log index `id`.
    pub(crate) fn new(id: SessionId, timeout: Duration, context: &Arc<StateMachineContext>) -> Self {
        Self {
            id,
            timeout,
            context: Arc::downgrade(context),
            connection: None,
            address: None,
            connect_index: 0,
            keep_alive_index: 0,
            request_sequence: 0,
            command_sequence: 0,
            // The registration entry itself is applied before the session
            // exists, so replay starts at the entry after it.
            last_applied: id.as_u64().saturating_sub(1),
            command_low_water_mark: 0,
            event_index: 0,
            complete_index: id.as_u64(),
            timestamp: 0,
            commands: HashMap::new(),
            sequence_queries: HashMap::new(),
            index_queries: HashMap::new(),
            responses: HashMap::new(),
            signals: HashMap::new(),
            events: VecDeque::new(),
            open_batch: None,
            suspect: false,
            unregistering: false,
            expired: false,
            closed: true,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The session's inactivity timeout; enforced by the registrar.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Highest log timestamp observed for this session.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Raise the observed log timestamp. Never retreats.
    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = self.timestamp.max(timestamp);
    }

    pub fn connect_index(&self) -> u64 {
        self.connect_index
    }

    pub fn set_connect_index(&mut self, index: u64) {
        self.connect_index = index;
    }

    pub fn keep_alive_index(&self) -> u64 {
        self.keep_alive_index
    }

    pub fn set_keep_alive_index(&mut self, index: u64) {
        self.keep_alive_index = index;
    }

    // ===== Sequencing of command submissions =====

    /// Highest request number accepted from the client for submission.
    pub fn request_sequence(&self) -> u64 {
        self.request_sequence
    }

    /// The request number the session expects next.
    pub fn next_request_sequence(&self) -> u64 {
        self.request_sequence + 1
    }

    /// Park a submission until its sequence number comes up.
    ///
    /// An existing registration for the same sequence is replaced.
    pub fn register_request(&mut self, sequence: u64, op: DeferredOp) {
        self.commands.insert(sequence, op);
    }

    /// Record that requests up to `request` have been accepted.
    ///
    /// Raising the sequence releases at most one parked submission: the one
    /// keyed by the sequence that was next-expected before the raise.
    /// Running it is expected to advance the sequence again (or park a later
    /// submission), so the chain drains one step at a time without
    /// re-entrant cascades.
    pub fn set_request_sequence(&mut self, request: u64) {
        if request > self.request_sequence {
            let next = self.request_sequence + 1;
            self.request_sequence = request;

            if let Some(op) = self.commands.remove(&next) {
                op(self);
            }
        }
    }

    // ===== Command-sequence and index advancement =====

    /// Highest request number whose command has been applied.
    pub fn command_sequence(&self) -> u64 {
        self.command_sequence
    }

    /// The command sequence the state machine will apply next.
    pub fn next_command_sequence(&self) -> u64 {
        self.command_sequence + 1
    }

    /// Park a query until the command sequence reaches `sequence`.
    ///
    /// Registration below the current sequence is accepted but inert: the
    /// trigger has already passed. Rejecting such queries is the caller's
    /// policy.
    pub fn register_sequence_query(&mut self, sequence: u64, op: DeferredOp) {
        self.sequence_queries.entry(sequence).or_default().push(op);
    }

    /// Park a query until the session's applied log index reaches `index`.
    pub fn register_index_query(&mut self, index: u64, op: DeferredOp) {
        self.index_queries.entry(index).or_default().push(op);
    }

    /// Advance the command sequence to `sequence`, one step at a time.
    ///
    /// At each step the queries parked for the step's sequence run in
    /// insertion order, after the counter has been advanced past them. If
    /// the target is ahead of the request sequence (replay on a follower
    /// later elected leader), the request sequence catches up the same way,
    /// draining any parked submissions along the path.
    pub fn set_command_sequence(&mut self, sequence: u64) {
        while self.command_sequence < sequence {
            self.command_sequence += 1;
            if let Some(queries) = self.sequence_queries.remove(&self.command_sequence) {
                for query in queries {
                    query(self);
                }
            }
        }

        if sequence > self.request_sequence {
            if self.commands.is_empty() {
                self.request_sequence = sequence;
            } else {
                while self.request_sequence < sequence {
                    let next = self.request_sequence + 1;
                    self.request_sequence = next;
                    if let Some(op) = self.commands.remove(&next) {
                        op(self);
                    }
                }
            }
        }
    }

    /// Highest log index applied for this session.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Advance the applied log index to `index`, draining index queries at
    /// each step exactly like [`set_command_sequence`](Self::set_command_sequence).
    pub fn set_last_applied(&mut self, index: u64) {
        while self.last_applied < index {
            self.last_applied += 1;
            if let Some(queries) = self.index_queries.remove(&self.last_applied) {
                for query in queries {
                    query(self);
                }
            }
        }
    }

    // ===== Response cache =====

    /// Cache a command's output so a retried submission returns the same
    /// result without re-executing.
    ///
    /// The optional signal is the completion the submitter waits on;
    /// flipping it is the caller's job, not the session's.
    pub fn register_response(
        &mut self,
        sequence: u64,
        response: Vec<u8>,
        signal: Option<ResponseSignal>,
    ) {
        self.responses.insert(sequence, response);
        if let Some(signal) = signal {
            self.signals.insert(sequence, signal);
        }
    }

    /// Cached output for `sequence`, if still addressable.
    pub fn response(&self, sequence: u64) -> Option<&[u8]> {
        self.responses.get(&sequence).map(Vec::as_slice)
    }

    /// Completion signal for `sequence`, for duplicate submissions to chain on.
    pub fn response_signal(&self, sequence: u64) -> Option<ResponseSignal> {
        self.signals.get(&sequence).cloned()
    }

    /// Highest sequence whose cached response has been discarded.
    pub fn command_low_water_mark(&self) -> u64 {
        self.command_low_water_mark
    }

    /// Drop cached responses and signals up to `sequence`. Monotone.
    pub fn clear_responses(&mut self, sequence: u64) {
        if sequence > self.command_low_water_mark {
            for i in self.command_low_water_mark + 1..=sequence {
                self.responses.remove(&i);
                self.signals.remove(&i);
                self.command_low_water_mark = i;
            }
        }
    }

    // ===== Event pipeline =====

    /// Log index at which the current event batch is being produced.
    pub fn event_index(&self) -> u64 {
        self.event_index
    }

    /// Highest event index the client has acknowledged.
    pub fn complete_index(&self) -> u64 {
        self.complete_index
    }

    /// Append an event to the batch for the entry being applied.
    ///
    /// Only valid during command application: the context must report a
    /// consistency level. If the client has already acknowledged past the
    /// current log index (delivery happened via another server), the event
    /// is silently dropped.
    pub(crate) fn publish(&mut self, name: &str, payload: Option<Vec<u8>>) -> Result<()> {
        if self.expired {
            return Err(SessionError::Expired(self.id));
        }
        if self.closed {
            return Err(SessionError::Closed(self.id));
        }
        let context = self
            .context
            .upgrade()
            .ok_or_else(|| SessionError::invalid_state("state machine context is gone"))?;
        if context.consistency().is_none() {
            return Err(SessionError::invalid_state(
                "session events can only be published during command execution",
            ));
        }

        let index = context.index();
        if self.complete_index > index {
            return Ok(());
        }

        let stale = self
            .open_batch
            .as_ref()
            .map_or(true, |batch| batch.event_index() != index);
        if stale {
            let previous = self.event_index;
            self.event_index = index;
            self.open_batch = Some(EventBatch::new(index, previous));
        }

        if let Some(batch) = self.open_batch.as_mut() {
            batch.push(Event {
                name: name.to_string(),
                payload,
            });
        }
        Ok(())
    }

    /// Seal the batch produced at `index`, queue it, and compose its send.
    ///
    /// Returns the delivery receipt for the batch (None when no events were
    /// published at this index) and the outbound send, if the send policy
    /// produced one.
    pub(crate) fn commit(&mut self, index: u64) -> (Option<DeliveryReceipt>, Option<EventSend>) {
        let ready = self
            .open_batch
            .as_ref()
            .is_some_and(|batch| batch.event_index() == index);
        if !ready {
            return (None, None);
        }
        let Some(mut batch) = self.open_batch.take() else {
            return (None, None);
        };

        let receipt = batch.take_receipt();
        let send = self.compose_send(&batch);
        self.events.push_back(batch);
        (receipt, send)
    }

    /// Index the keep-alive path reports as completed for this session.
    ///
    /// While batches are queued, everything before the first queued batch is
    /// complete; otherwise the session is caught up to its applied index.
    pub fn last_completed(&self) -> u64 {
        match self.events.front() {
            Some(batch) if batch.event_index() > self.complete_index => batch.event_index() - 1,
            _ => self.last_applied,
        }
    }

    /// Acknowledge batches up to `index`: pop them, resolve their receipts,
    /// and raise the complete index. Stale acknowledgements are ignored.
    pub(crate) fn clear_events(&mut self, index: u64) {
        if index <= self.complete_index {
            log::trace!(
                "session {}: ignoring stale ack for index {} (complete index {})",
                self.id,
                index,
                self.complete_index
            );
            return;
        }

        while let Some(front) = self.events.front_mut() {
            if front.event_index() > index {
                break;
            }
            self.complete_index = front.event_index();
            front.acknowledge();
            self.events.pop_front();
        }
        self.complete_index = index;
    }

    /// Acknowledge up to `index` and re-send every still-queued batch on the
    /// attached connection.
    pub(crate) fn resend_events(&mut self, index: u64) -> Vec<EventSend> {
        if index <= self.complete_index {
            return Vec::new();
        }
        self.clear_events(index);

        let mut sends = Vec::new();
        for batch in &self.events {
            if let Some(send) = self.sequential_send(batch) {
                sends.push(send);
            }
        }
        log::debug!(
            "session {}: resending {} queued event batch(es) from index {}",
            self.id,
            sends.len(),
            index
        );
        sends
    }

    /// Apply a publish acknowledgement, composing resends if requested.
    ///
    /// Responses arriving after the session closed are ignored; the
    /// reconnect path owns recovery from there.
    pub(crate) fn handle_publish_response(&mut self, response: PublishResponse) -> Vec<EventSend> {
        if self.closed {
            return Vec::new();
        }
        match response.status {
            ResponseStatus::Ok => {
                self.clear_events(response.index);
                Vec::new()
            }
            ResponseStatus::Error if response.error.is_none() => self.resend_events(response.index),
            ResponseStatus::Error => Vec::new(),
        }
    }

    /// Compose the send for a freshly committed batch per the send policy.
    ///
    /// Linearizable events on the leader's synchronous path go out even
    /// without an attached connection, via a registry lookup of the
    /// session's last-known address. Everything else rides the attached
    /// connection or waits for the client to reconnect and resend.
    fn compose_send(&self, batch: &EventBatch) -> Option<EventSend> {
        let context = self.context.upgrade()?;
        let consistency = context.consistency();

        if context.synchronous() && consistency == Some(ConsistencyLevel::Linearizable) {
            if let Some(connection) = &self.connection {
                Some(EventSend {
                    target: SendTarget::Attached(connection.clone()),
                    request: self.publish_request(batch),
                })
            } else if let Some(address) = &self.address {
                Some(EventSend {
                    target: SendTarget::Lookup(context.connections().clone(), address.clone()),
                    request: self.publish_request(batch),
                })
            } else {
                None
            }
        } else if consistency != Some(ConsistencyLevel::Linearizable) {
            self.sequential_send(batch)
        } else {
            None
        }
    }

    fn sequential_send(&self, batch: &EventBatch) -> Option<EventSend> {
        let connection = self.connection.as_ref()?;
        Some(EventSend {
            target: SendTarget::Attached(connection.clone()),
            request: self.publish_request(batch),
        })
    }

    fn publish_request(&self, batch: &EventBatch) -> PublishRequest {
        batch.to_request(self.id, self.complete_index)
    }

    // ===== Connection and address =====

    pub(crate) fn set_connection(&mut self, connection: Option<Arc<dyn Connection>>) {
        self.connection = connection;
    }

    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.as_ref()
    }

    /// Record the client's last-known address, the linearizable fallback.
    pub fn set_address(&mut self, address: Address) {
        self.address = Some(address);
    }

    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    // ===== Lifecycle =====

    pub(crate) fn open(&mut self) {
        self.closed = false;
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    /// Expire the session: close it and release every waiter still parked
    /// on a queued batch. Waiters observe the expiry through the close
    /// listeners, not through their receipts.
    pub(crate) fn expire(&mut self) {
        self.closed = true;
        self.expired = true;
        for batch in &mut self.events {
            batch.acknowledge();
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub(crate) fn suspect(&mut self) {
        self.suspect = true;
    }

    pub(crate) fn trust(&mut self) {
        self.suspect = false;
    }

    pub fn is_suspect(&self) -> bool {
        self.suspect
    }

    pub(crate) fn unregister(&mut self) {
        self.unregistering = true;
    }

    pub fn is_unregistering(&self) -> bool {
        self.unregistering
    }

    #[cfg(test)]
    pub(crate) fn queued_event_count(&self) -> usize {
        self.events.len()
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("id", &self.id)
            .field("request_sequence", &self.request_sequence)
            .field("command_sequence", &self.command_sequence)
            .field("last_applied", &self.last_applied)
            .field("event_index", &self.event_index)
            .field("complete_index", &self.complete_index)
            .field("closed", &self.closed)
            .field("expired", &self.expired)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use quorumdb_commons::PublishResponse;

    use crate::connection::ConnectionRegistry;
    use crate::error::SessionError;

    struct NoRegistry;

    #[async_trait]
    impl ConnectionRegistry for NoRegistry {
        async fn connection_to(
            &self,
            address: &Address,
        ) -> crate::error::Result<Arc<dyn Connection>> {
            Err(SessionError::transport(format!("no route to {address}")))
        }
    }

    fn context() -> Arc<StateMachineContext> {
        Arc::new(StateMachineContext::new(Arc::new(NoRegistry)))
    }

    fn state_with(id: u64, context: &Arc<StateMachineContext>) -> SessionState {
        let mut state = SessionState::new(SessionId::new(id), Duration::from_secs(30), context);
        state.open();
        state
    }

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> DeferredOp {
        let log = log.clone();
        Box::new(move |_state| log.lock().unwrap().push(tag))
    }

    #[test]
    fn test_out_of_order_submissions_drain_in_sequence() {
        let ctx = context();
        let mut state = state_with(1, &ctx);
        let log = Arc::new(Mutex::new(Vec::new()));

        // Registered out of order: 3 before 2.
        state.register_request(3, record(&log, "three"));
        {
            let log = log.clone();
            state.register_request(
                2,
                Box::new(move |state| {
                    log.lock().unwrap().push("two");
                    // Running the submission advances the sequence itself,
                    // releasing the next one in the chain.
                    state.set_request_sequence(3);
                }),
            );
        }

        state.set_request_sequence(1);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(state.request_sequence(), 1);

        // 1 -> 2 releases the submission at 2, which advances to 3 and
        // thereby releases the one parked there.
        state.set_request_sequence(2);
        assert_eq!(*log.lock().unwrap(), vec!["two", "three"]);
        assert_eq!(state.request_sequence(), 3);
    }

    #[test]
    fn test_request_sequence_never_retreats() {
        let ctx = context();
        let mut state = state_with(1, &ctx);
        state.set_request_sequence(5);
        state.set_request_sequence(3);
        assert_eq!(state.request_sequence(), 5);
    }

    #[test]
    fn test_sequence_query_gating() {
        let ctx = context();
        let mut state = state_with(1, &ctx);
        let log = Arc::new(Mutex::new(Vec::new()));

        state.register_sequence_query(5, record(&log, "q5"));

        state.set_command_sequence(3);
        assert!(log.lock().unwrap().is_empty());

        state.set_command_sequence(5);
        assert_eq!(*log.lock().unwrap(), vec!["q5"]);

        // Runs exactly once.
        state.set_command_sequence(6);
        assert_eq!(*log.lock().unwrap(), vec!["q5"]);
        assert_eq!(state.command_sequence(), 6);
    }

    #[test]
    fn test_sequence_queries_run_in_insertion_order_across_steps() {
        let ctx = context();
        let mut state = state_with(1, &ctx);
        let log = Arc::new(Mutex::new(Vec::new()));

        state.register_sequence_query(2, record(&log, "2a"));
        state.register_sequence_query(3, record(&log, "3a"));
        state.register_sequence_query(2, record(&log, "2b"));

        state.set_command_sequence(3);
        assert_eq!(*log.lock().unwrap(), vec!["2a", "2b", "3a"]);
    }

    #[test]
    fn test_command_sequence_monotone_over_any_call_sequence() {
        let ctx = context();
        let mut state = state_with(1, &ctx);

        let mut high = 0;
        for target in [0, 2, 2, 7, 4, 7, 9] {
            state.set_command_sequence(target);
            high = high.max(target);
            assert_eq!(state.command_sequence(), high);
        }
    }

    #[test]
    fn test_command_sequence_catch_up_drains_registered_submissions() {
        let ctx = context();
        let mut state = state_with(1, &ctx);
        let log = Arc::new(Mutex::new(Vec::new()));

        state.register_request(2, record(&log, "two"));
        state.register_request(4, record(&log, "four"));

        // Replay path: the command sequence overtakes the request sequence
        // and walks it forward, draining parked submissions on the way.
        state.set_command_sequence(4);
        assert_eq!(*log.lock().unwrap(), vec!["two", "four"]);
        assert_eq!(state.request_sequence(), 4);
        assert_eq!(state.command_sequence(), 4);
    }

    #[test]
    fn test_command_sequence_catch_up_without_submissions_jumps() {
        let ctx = context();
        let mut state = state_with(1, &ctx);
        state.set_command_sequence(9);
        assert_eq!(state.request_sequence(), 9);
    }

    #[test]
    fn test_index_query_gating_starts_after_registration_index() {
        let ctx = context();
        // Session registered at log index 10: replay resumes at 10.
        let mut state = state_with(10, &ctx);
        assert_eq!(state.last_applied(), 9);

        let log = Arc::new(Mutex::new(Vec::new()));
        state.register_index_query(12, record(&log, "q12"));

        state.set_last_applied(11);
        assert!(log.lock().unwrap().is_empty());

        state.set_last_applied(13);
        assert_eq!(*log.lock().unwrap(), vec!["q12"]);
        assert_eq!(state.last_applied(), 13);
    }

    #[test]
    fn test_query_callback_may_register_follow_up() {
        let ctx = context();
        let mut state = state_with(1, &ctx);
        let log = Arc::new(Mutex::new(Vec::new()));

        {
            let log = log.clone();
            state.register_sequence_query(
                2,
                Box::new(move |state| {
                    log.lock().unwrap().push("first");
                    let log = log.clone();
                    // A follow-up for a later sequence fires on the next
                    // advancement step.
                    state.register_sequence_query(
                        3,
                        Box::new(move |_| log.lock().unwrap().push("second")),
                    );
                }),
            );
        }

        state.set_command_sequence(3);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_response_cache_gc() {
        let ctx = context();
        let mut state = state_with(1, &ctx);

        state.register_response(1, b"a".to_vec(), None);
        state.register_response(2, b"b".to_vec(), None);
        state.register_response(3, b"c".to_vec(), None);

        state.clear_responses(2);
        assert_eq!(state.command_low_water_mark(), 2);
        assert!(state.response(1).is_none());
        assert!(state.response(2).is_none());
        assert_eq!(state.response(3), Some(&b"c"[..]));

        // Second clear at the same watermark is a no-op.
        state.clear_responses(2);
        assert_eq!(state.command_low_water_mark(), 2);
        assert_eq!(state.response(3), Some(&b"c"[..]));
    }

    #[test]
    fn test_response_signal_removed_in_lockstep() {
        let ctx = context();
        let mut state = state_with(1, &ctx);

        let (tx, rx) = watch::channel(false);
        state.register_response(1, b"a".to_vec(), Some(rx));
        assert!(state.response_signal(1).is_some());

        state.clear_responses(1);
        assert!(state.response_signal(1).is_none());
        drop(tx);
    }

    #[test]
    fn test_publish_outside_command_is_invalid_state() {
        let ctx = context();
        let mut state = state_with(1, &ctx);

        // No command context set: consistency is None.
        let err = state.publish("joined", None).unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
    }

    #[test]
    fn test_publish_on_closed_session_is_rejected() {
        let ctx = context();
        let mut state =
            SessionState::new(SessionId::new(1), Duration::from_secs(30), &ctx);
        let err = state.publish("joined", None).unwrap_err();
        assert!(matches!(err, SessionError::Closed(_)));
    }

    #[test]
    fn test_publish_on_expired_session_reports_expiry() {
        let ctx = context();
        let mut state = state_with(1, &ctx);
        state.expire();
        let err = state.publish("joined", None).unwrap_err();
        assert!(matches!(err, SessionError::Expired(_)));
    }

    #[test]
    fn test_publish_batches_roll_per_index_and_chain_previous() {
        let ctx = context();
        let mut state = state_with(1, &ctx);

        ctx.update(5, false, Some(ConsistencyLevel::Sequential));
        state.publish("a", None).unwrap();
        state.publish("b", None).unwrap();
        let (receipt_a, send_a) = state.commit(5);
        assert!(receipt_a.is_some());
        assert!(send_a.is_none()); // sequential with no connection

        ctx.update(7, false, Some(ConsistencyLevel::Sequential));
        state.publish("c", None).unwrap();
        let (receipt_b, _) = state.commit(7);
        assert!(receipt_b.is_some());

        assert_eq!(state.queued_event_count(), 2);
        assert_eq!(state.event_index(), 7);
        // The second batch chains back to the first.
        let second = state.events.back().unwrap();
        assert_eq!(second.previous_index(), 5);
        assert_eq!(second.events().len(), 1);
    }

    #[test]
    fn test_publish_dropped_when_client_acked_past_index() {
        let ctx = context();
        // complete_index starts at the session id.
        let mut state = state_with(10, &ctx);

        ctx.update(7, false, Some(ConsistencyLevel::Sequential));
        state.publish("late", None).unwrap();
        let (receipt, send) = state.commit(7);
        assert!(receipt.is_none());
        assert!(send.is_none());
        assert_eq!(state.queued_event_count(), 0);
    }

    #[test]
    fn test_commit_without_batch_is_noop() {
        let ctx = context();
        let mut state = state_with(1, &ctx);
        let (receipt, send) = state.commit(9);
        assert!(receipt.is_none());
        assert!(send.is_none());
    }

    #[test]
    fn test_clear_events_resolves_receipts_and_raises_complete_index() {
        let ctx = context();
        let mut state = state_with(1, &ctx);

        ctx.update(5, false, Some(ConsistencyLevel::Sequential));
        state.publish("a", None).unwrap();
        let (receipt_a, _) = state.commit(5);
        ctx.update(7, false, Some(ConsistencyLevel::Sequential));
        state.publish("b", None).unwrap();
        let (receipt_b, _) = state.commit(7);

        let mut receipt_a = receipt_a.unwrap();
        let mut receipt_b = receipt_b.unwrap();

        state.clear_events(6);
        assert_eq!(state.complete_index(), 6);
        assert_eq!(state.queued_event_count(), 1);
        assert!(receipt_a.try_recv().is_ok());
        assert!(receipt_b.try_recv().is_err());

        state.clear_events(7);
        assert_eq!(state.complete_index(), 7);
        assert_eq!(state.queued_event_count(), 0);
        assert!(receipt_b.try_recv().is_ok());
    }

    #[test]
    fn test_stale_ack_ignored() {
        let ctx = context();
        let mut state = state_with(4, &ctx);
        assert_eq!(state.complete_index(), 4);

        state.clear_events(3);
        assert_eq!(state.complete_index(), 4);

        let sends = state.resend_events(2);
        assert!(sends.is_empty());
    }

    #[test]
    fn test_last_completed() {
        let ctx = context();
        let mut state = state_with(1, &ctx);
        state.set_last_applied(4);
        assert_eq!(state.last_completed(), 4);

        ctx.update(6, false, Some(ConsistencyLevel::Sequential));
        state.publish("a", None).unwrap();
        state.commit(6);
        // Everything before the first queued batch is complete.
        assert_eq!(state.last_completed(), 5);

        state.clear_events(6);
        assert_eq!(state.last_completed(), 4);
    }

    #[test]
    fn test_expire_releases_queued_receipts() {
        let ctx = context();
        let mut state = state_with(1, &ctx);

        ctx.update(5, false, Some(ConsistencyLevel::Sequential));
        state.publish("a", None).unwrap();
        let (receipt, _) = state.commit(5);
        let mut receipt = receipt.unwrap();

        state.expire();
        assert!(state.is_closed());
        assert!(state.is_expired());
        assert!(receipt.try_recv().is_ok());
        // The queue itself is untouched by expiry.
        assert_eq!(state.queued_event_count(), 1);
    }

    #[test]
    fn test_publish_response_paths() {
        let ctx = context();
        let mut state = state_with(1, &ctx);

        ctx.update(5, false, Some(ConsistencyLevel::Sequential));
        state.publish("a", None).unwrap();
        state.commit(5);

        // OK acknowledges and clears.
        let sends = state.handle_publish_response(PublishResponse::ok(5));
        assert!(sends.is_empty());
        assert_eq!(state.complete_index(), 5);
        assert_eq!(state.queued_event_count(), 0);

        // Error with payload is terminal for this attempt: no resend.
        ctx.update(8, false, Some(ConsistencyLevel::Sequential));
        state.publish("b", None).unwrap();
        state.commit(8);
        let sends = state.handle_publish_response(PublishResponse::failed(5, "boom"));
        assert!(sends.is_empty());
        assert_eq!(state.queued_event_count(), 1);

        // Responses after close are ignored outright.
        state.close();
        let sends = state.handle_publish_response(PublishResponse::ok(8));
        assert!(sends.is_empty());
        assert_eq!(state.queued_event_count(), 1);
    }

    #[test]
    fn test_timestamp_is_monotone() {
        let ctx = context();
        let mut state = state_with(1, &ctx);
        state.set_timestamp(100);
        state.set_timestamp(50);
        assert_eq!(state.timestamp(), 100);
        state.set_timestamp(150);
        assert_eq!(state.timestamp(), 150);
    }

    #[test]
    fn test_lifecycle_flags() {
        let ctx = context();
        let mut state = SessionState::new(SessionId::new(1), Duration::from_secs(30), &ctx);
        assert!(state.is_closed());
        assert!(!state.is_expired());

        state.open();
        assert!(state.is_open());

        state.suspect();
        assert!(state.is_suspect());
        state.trust();
        assert!(!state.is_suspect());

        state.unregister();
        assert!(state.is_unregistering());

        state.close();
        assert!(state.is_closed());
        assert!(!state.is_expired());
    }
}
