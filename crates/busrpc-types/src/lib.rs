//! # busrpc Types
//!
//! Everything that crosses the message bus is defined here: the request,
//! reply, claim and stream envelopes, the structured `RpcError`, the
//! `ServiceDefinition` identifying an instance, and the `MethodPolicy` that
//! every peer registers for a method.
//!
//! ## Design Principles
//!
//! - **Correlation by request id**: every reply, claim offer, selection and
//!   stream frame carries the id of the call it belongs to.
//! - **Errors are data**: handler failures travel inside `Response.result`
//!   and are never raised across the bus.
//! - **Payload agnostic**: envelopes carry already-encoded payload bytes.

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod info;

pub use envelope::{
    ClaimOffer, ClaimSelection, FrameBody, Reply, Request, RequestKind, Response, StreamFrame,
};
pub use errors::{ErrorCode, RpcError, RpcResult};
pub use info::{Dispatch, MethodPolicy, ServiceDefinition, Topic};

/// Current unix time in milliseconds, the timestamp unit used by all envelopes.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
