//! Payload encoding for request and response values.
//!
//! Envelopes are always bincode (see `busrpc_bus::codec`); the values inside
//! them use the configured [`PayloadCodec`].

use crate::config::PayloadCodec;
use busrpc_bus::BusError;
use busrpc_types::{ErrorCode, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;

impl PayloadCodec {
    /// Encode a request or response value.
    ///
    /// # Errors
    ///
    /// `Internal` if the value cannot be serialized.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, RpcError> {
        match self {
            PayloadCodec::Bincode => bincode::serialize(value).map_err(|e| e.to_string()),
            PayloadCodec::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
        }
        .map_err(|e| RpcError::internal(format!("payload encode failed: {e}")))
    }

    /// Decode a payload, reporting failures with `malformed`
    /// (`MalformedRequest` on servers, `MalformedResponse` on clients).
    pub fn decode<T: DeserializeOwned>(
        self,
        bytes: &[u8],
        malformed: ErrorCode,
    ) -> Result<T, RpcError> {
        match self {
            PayloadCodec::Bincode => bincode::deserialize(bytes).map_err(|e| e.to_string()),
            PayloadCodec::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        }
        .map_err(|e| RpcError::new(malformed, format!("payload decode failed: {e}")))
    }
}

/// Map a bus failure into the error returned to RPC callers.
pub(crate) fn bus_error(err: BusError) -> RpcError {
    match err {
        BusError::Closed | BusError::Backend(_) => RpcError::unavailable(err.to_string()),
        BusError::Encode(_) => RpcError::internal(err.to_string()),
        BusError::Decode(_) => RpcError::new(ErrorCode::MalformedResponse, err.to_string()),
    }
}
