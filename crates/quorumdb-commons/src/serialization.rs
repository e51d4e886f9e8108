//! Serialization helpers for wire-visible payloads.
//!
//! This module provides simple helper functions for serializing and
//! deserializing data using JSON. Bit-level wire framing belongs to the
//! transport, not to this layer.

use serde::{de::DeserializeOwned, Serialize};

use crate::errors::CommonError;

/// Encode a value to bytes using JSON.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CommonError> {
    serde_json::to_vec(value).map_err(|e| CommonError::Serialization(e.to_string()))
}

/// Decode a value from bytes using JSON.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CommonError> {
    serde_json::from_slice(bytes).map_err(|e| CommonError::Serialization(e.to_string()))
}
