//! # Error Types
//!
//! The structured error carried by `Response` envelopes and returned by every
//! client call.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used throughout busrpc.
pub type RpcResult<T> = Result<T, RpcError>;

/// Error classification shared by clients and servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unclassified failure.
    Unknown,
    /// The caller cancelled the call, or the call was closed under it.
    Canceled,
    /// No reply arrived before the deadline.
    DeadlineExceeded,
    /// No server claimed the request, or the bus could not deliver it.
    Unavailable,
    /// Handler failure.
    Internal,
    /// Malformed registration or call arguments.
    InvalidArgument,
    /// Duplicate claim acceptance for a request id.
    AlreadyExists,
    /// The addressed entity does not exist.
    NotFound,
    /// The method exists but the requested operation is not implemented.
    Unimplemented,
    /// The request payload could not be decoded by the server.
    MalformedRequest,
    /// The response payload could not be decoded by the client.
    MalformedResponse,
}

impl ErrorCode {
    /// Stable lowercase name, used in logs and metric labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::Canceled => "canceled",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Internal => "internal",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Unimplemented => "unimplemented",
            ErrorCode::MalformedRequest => "malformed_request",
            ErrorCode::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured RPC error: a code plus a human readable message.
///
/// Errors returned by handlers are transmitted unmodified, so a client
/// comparing against the value a handler returned sees an equal error.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RpcError {
    code: ErrorCode,
    message: String,
}

impl RpcError {
    /// Create an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    /// The error every operation on a closed stream returns.
    #[must_use]
    pub fn stream_closed() -> Self {
        Self::canceled("stream closed")
    }
}
