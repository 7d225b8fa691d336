//! Identifier generation.
//!
//! Ids are random, prefixed by what they identify so they are easy to tell
//! apart in logs: `REQ_`, `STR_`, `SRV_`, `CLI_`.

use uuid::Uuid;

fn prefixed(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

/// A random string with no prefix, e.g. for test channel names.
#[must_use]
pub fn new_string() -> String {
    Uuid::new_v4().simple().to_string()
}

#[must_use]
pub fn new_request_id() -> String {
    prefixed("REQ_")
}

#[must_use]
pub fn new_stream_id() -> String {
    prefixed("STR_")
}

#[must_use]
pub fn new_server_id() -> String {
    prefixed("SRV_")
}

#[must_use]
pub fn new_client_id() -> String {
    prefixed("CLI_")
}
