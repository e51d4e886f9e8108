//! QuorumDB client session layer
//!
//! This crate implements the server-side session object of the QuorumDB
//! replicated state machine: the per-client bookkeeping that provides
//! linearizable and sequential semantics on top of the totally-ordered
//! replicated log. A session is created when a register-client entry is
//! applied and is replicated to every server, so each replica derives
//! identical session state by replay.
//!
//! ## Key Components
//!
//! - [`ClientSession`]: the session handle; client-facing surface
//!   (`publish`, listeners, lifecycle predicates) plus the executor-facing
//!   surface driven during log application
//! - [`SessionState`]: the single-writer core holding counters, deferred
//!   maps, the response cache, and the event queue
//! - [`StateMachineContext`]: per-entry execution context shared by the
//!   executor and its sessions
//! - [`Connection`] / [`ConnectionRegistry`]: transport collaborator
//!   contracts
//! - [`EventBatch`]: events accumulated while one log entry is applied,
//!   delivered as a unit and acknowledged by index
//!
//! ## Ordering guarantees
//!
//! - Submissions run in strictly increasing request-sequence order
//! - Queries gated on a sequence or index run when the session first
//!   reaches it, in insertion order
//! - Event batches are delivered per session in strictly increasing
//!   event-index order, each carrying the previous batch's index so the
//!   client can detect gaps
//! - Linearizable event delivery happens before the command's reply

pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod listeners;
pub mod session;
pub mod state;

// Re-exports - session surface
pub use session::{ClientSession, EventCallback, SessionCallback};
pub use state::{DeferredOp, ResponseSignal, SessionState};

// Re-exports - collaborator contracts
pub use connection::{Address, Connection, ConnectionRegistry, PublishHandler};
pub use context::StateMachineContext;

// Re-exports - events and errors
pub use error::{Result, SessionError};
pub use events::{DeliveryReceipt, EventBatch};
pub use listeners::{ListenerHandle, Listeners};
