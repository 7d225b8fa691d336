//! # Channel Addressing
//!
//! Deterministic derivation of bus channels from service name, method name
//! and call identity. Every channel carries both a flat legacy name and a
//! structured name; the bus backend picks one, dispatch code never does.
//!
//! | Channel | legacy | structured |
//! |---------|--------|------------|
//! | request | `S\|M\|T…\|REQ` | `S.M.T….request` |
//! | reply | `S\|M\|R\|RES` | `S.M.reply.R` |
//! | claim offers | `S\|M\|R\|CLAIM` | `S.M.claim.R` |
//! | claim selection | `S\|M\|R\|RCLAIM` | `S.M.claim.R.selected` |
//! | stream to server | `S\|M\|X\|STR_SRV` | `S.M.stream.X.server` |
//! | stream to client | `S\|M\|X\|STR_CLI` | `S.M.stream.X.client` |
//!
//! Service, method and topic segments must be non-empty and free of `|` and
//! `.`, otherwise two different addresses could resolve to one channel.

use busrpc_bus::Channel;
use busrpc_types::{RpcError, Topic};

const LEGACY_SEP: &str = "|";
const SERVER_SEP: &str = ".";

/// Reject a name that would be ambiguous inside a channel name.
///
/// # Errors
///
/// `InvalidArgument` for empty names or names containing a separator.
pub fn validate_segment(kind: &str, name: &str) -> Result<(), RpcError> {
    if name.is_empty() {
        return Err(RpcError::invalid_argument(format!("{kind} name is empty")));
    }
    if name.contains(LEGACY_SEP) || name.contains(SERVER_SEP) {
        return Err(RpcError::invalid_argument(format!(
            "{kind} name '{name}' contains a channel separator ('{LEGACY_SEP}' or '{SERVER_SEP}')"
        )));
    }
    Ok(())
}

/// [`validate_segment`] for every segment of `topic`.
///
/// # Errors
///
/// As [`validate_segment`].
pub fn validate_topic(topic: &Topic) -> Result<(), RpcError> {
    topic
        .segments()
        .iter()
        .try_for_each(|segment| validate_segment("topic", segment))
}

fn legacy(parts: &[&str]) -> String {
    parts.join(LEGACY_SEP)
}

fn structured(parts: &[&str]) -> String {
    parts.join(SERVER_SEP)
}

/// Channel shared by every server registered for `method` under `topic`.
pub fn request_channel(service: &str, method: &str, topic: &Topic) -> Channel {
    let mut parts: Vec<&str> = Vec::with_capacity(topic.segments().len() + 3);
    parts.push(service);
    parts.push(method);
    parts.extend(topic.segments().iter().map(String::as_str));

    let mut legacy_parts = parts.clone();
    legacy_parts.push("REQ");
    parts.push("request");

    Channel::new(legacy(&legacy_parts), structured(&parts))
}

/// Private reply channel of one call.
pub fn reply_channel(service: &str, method: &str, request_id: &str) -> Channel {
    Channel::new(
        legacy(&[service, method, request_id, "RES"]),
        structured(&[service, method, "reply", request_id]),
    )
}

/// Channel on which servers publish claim offers for one call.
pub fn claim_channel(service: &str, method: &str, request_id: &str) -> Channel {
    Channel::new(
        legacy(&[service, method, request_id, "CLAIM"]),
        structured(&[service, method, "claim", request_id]),
    )
}

/// Channel on which the client announces the claim winner.
pub fn selection_channel(service: &str, method: &str, request_id: &str) -> Channel {
    Channel::new(
        legacy(&[service, method, request_id, "RCLAIM"]),
        structured(&[service, method, "claim", request_id, "selected"]),
    )
}

/// Frames travelling from the client to the server owning the stream.
pub fn stream_server_channel(service: &str, method: &str, stream_id: &str) -> Channel {
    Channel::new(
        legacy(&[service, method, stream_id, "STR_SRV"]),
        structured(&[service, method, "stream", stream_id, "server"]),
    )
}

/// Frames travelling from the server to the client that opened the stream.
pub fn stream_client_channel(service: &str, method: &str, stream_id: &str) -> Channel {
    Channel::new(
        legacy(&[service, method, stream_id, "STR_CLI"]),
        structured(&[service, method, "stream", stream_id, "client"]),
    )
}
