//! Envelope encoding for bus messages.

use crate::contract::BusError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a message for publishing.
///
/// # Errors
///
/// `BusError::Encode` if serialization fails.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, BusError> {
    bincode::serialize(message)
        .map(Bytes::from)
        .map_err(|e| BusError::Encode(e.to_string()))
}

/// Decode a received message.
///
/// # Errors
///
/// `BusError::Decode` if the bytes are not a valid `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BusError> {
    bincode::deserialize(bytes).map_err(|e| BusError::Decode(e.to_string()))
}
