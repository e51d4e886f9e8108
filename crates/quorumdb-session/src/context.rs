//! Per-entry execution context of the state machine.
//!
//! The state machine executor applies committed log entries one at a time.
//! Before each entry it updates the shared [`StateMachineContext`] with the
//! entry's log index, the consistency level of the command being applied
//! (None outside command application), and whether the current apply is the
//! leader's synchronous path. Sessions read the context when events are
//! published and committed.
//!
//! Sessions hold a `Weak` back-reference: the context outlives every
//! session it serves, and a session must never extend its lifetime.

use std::sync::Arc;

use parking_lot::RwLock;
use quorumdb_commons::ConsistencyLevel;

use crate::connection::ConnectionRegistry;

/// Mutable per-entry snapshot, swapped wholesale by `update`.
#[derive(Debug, Clone, Copy, Default)]
struct ContextState {
    index: u64,
    synchronous: bool,
    consistency: Option<ConsistencyLevel>,
}

/// Execution context shared by the state machine executor and its sessions.
pub struct StateMachineContext {
    state: RwLock<ContextState>,
    connections: Arc<dyn ConnectionRegistry>,
}

impl StateMachineContext {
    /// Create a context backed by the given connection registry.
    pub fn new(connections: Arc<dyn ConnectionRegistry>) -> Self {
        Self {
            state: RwLock::new(ContextState::default()),
            connections,
        }
    }

    /// Update the context for the entry about to be applied.
    ///
    /// `consistency` is `None` for entries that are not commands; publishing
    /// session events is rejected while it is `None`.
    pub fn update(
        &self,
        index: u64,
        synchronous: bool,
        consistency: Option<ConsistencyLevel>,
    ) {
        let mut state = self.state.write();
        state.index = index;
        state.synchronous = synchronous;
        state.consistency = consistency;
    }

    /// Log index of the entry currently being applied.
    pub fn index(&self) -> u64 {
        self.state.read().index
    }

    /// Whether the current apply is the leader's synchronous path.
    pub fn synchronous(&self) -> bool {
        self.state.read().synchronous
    }

    /// Consistency level of the command being applied, if any.
    pub fn consistency(&self) -> Option<ConsistencyLevel> {
        self.state.read().consistency
    }

    /// The server's connection registry.
    pub fn connections(&self) -> &Arc<dyn ConnectionRegistry> {
        &self.connections
    }
}

impl std::fmt::Debug for StateMachineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("StateMachineContext")
            .field("index", &state.index)
            .field("synchronous", &state.synchronous)
            .field("consistency", &state.consistency)
            .finish()
    }
}
