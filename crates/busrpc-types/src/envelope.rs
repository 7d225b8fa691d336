//! # Wire Envelopes
//!
//! The messages exchanged on busrpc channels. Payloads are opaque bytes
//! produced by the caller's payload codec; envelopes themselves are encoded by
//! the bus layer.
//!
//! ```text
//! client                                   server(s)
//!   │ ── Request ──────────────────────────▶ │   request channel
//!   │ ◀──────────────────────── ClaimOffer ─ │   claim channel      (claim only)
//!   │ ── ClaimSelection ───────────────────▶ │   selection channel  (claim only)
//!   │ ◀───────────────────────── Reply::Ack ─ │   reply channel      (broadcast only)
//!   │ ◀──────────────────── Reply::Response ─ │   reply channel
//! ```

use crate::errors::RpcError;
use crate::info::Topic;
use serde::{Deserialize, Serialize};

/// What a request asks the server to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Single response expected.
    Unary,
    /// Every server answers.
    Multi,
    /// Open a bidirectional stream identified by `stream_id`.
    StreamOpen { stream_id: String },
}

/// A call, published on the method's request channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    // =========================================================================
    // CORRELATION
    // =========================================================================
    /// Caller-generated unique id; the correlation key for all replies.
    pub request_id: String,
    /// Instance id of the calling client.
    pub client_id: String,
    pub method: String,
    pub topic: Topic,

    // =========================================================================
    // TIMING (unix milliseconds)
    // =========================================================================
    pub sent_at: i64,
    /// After this instant servers drop the request instead of handling it.
    pub expiry: i64,

    // =========================================================================
    // BODY
    // =========================================================================
    pub kind: RequestKind,
    pub payload: Vec<u8>,
}

impl Request {
    /// Whether the request expired at `now` (unix milliseconds).
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expiry
    }
}

/// A server's answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: String,
    pub server_id: String,
    pub sent_at: i64,
    /// Encoded response payload, or the handler's error.
    pub result: Result<Vec<u8>, RpcError>,
}

/// Message flowing on a reply channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// A broadcast responder announcing it will answer.
    Ack { request_id: String, server_id: String },
    Response(Response),
}

impl Reply {
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Reply::Ack { request_id, .. } => request_id,
            Reply::Response(response) => &response.request_id,
        }
    }
}

/// A server's bid to handle a claim-required request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimOffer {
    pub request_id: String,
    pub server_id: String,
    /// Suitability in `[0, 1]`; `None` is an explicit decline.
    pub affinity: Option<f32>,
}

/// The client's decision at the end of a claim window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSelection {
    pub request_id: String,
    /// The winner, or `None` when the client abandoned the call.
    pub server_id: Option<String>,
}

/// Body of a stream frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrameBody {
    /// The server accepted the stream.
    OpenAck { server_id: String },
    Message(Vec<u8>),
    /// Acknowledges the `Message` frame with the same `frame_id`.
    Ack,
    Close(Option<RpcError>),
}

/// One correlated unit of a bidirectional stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub stream_id: String,
    /// Sender-local sequence number; acks echo it.
    pub frame_id: u64,
    pub sent_at: i64,
    pub body: FrameBody,
}
