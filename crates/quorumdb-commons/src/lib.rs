//! # quorumdb-commons
//!
//! Shared types and utilities for QuorumDB.
//!
//! This crate provides the foundational types used across the QuorumDB
//! crates: type-safe identifiers, the event wire models exchanged between
//! servers and clients, and serialization helpers. It carries no heavy
//! dependencies so it can sit at the bottom of the dependency graph.
//!
//! ## Type-Safe Wrappers
//!
//! - `SessionId`: session identifier; doubles as the log index at which the
//!   session was registered
//!
//! ## Wire Models
//!
//! - `Event`: a named event with an optional opaque payload
//! - `PublishRequest` / `PublishResponse`: event-batch delivery and its
//!   acknowledgement

pub mod errors;
pub mod ids;
pub mod models;
pub mod serialization;

// Re-export commonly used types at crate root
pub use errors::{CommonError, Result};
pub use ids::SessionId;
pub use models::{ConsistencyLevel, Event, PublishRequest, PublishResponse, ResponseStatus};
