//! # Service Identity and Method Policies

use crate::errors::RpcError;
use crate::ids;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a server or client instance.
///
/// Supplied by the hosting process at startup and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Service name, shared by every instance of the service.
    pub name: String,
    /// Instance id, unique per process.
    pub id: String,
}

impl ServiceDefinition {
    /// Definition with an explicit instance id.
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    /// Definition for a server instance with a generated `SRV_` id.
    pub fn server(name: impl Into<String>) -> Self {
        Self::new(name, ids::new_server_id())
    }

    /// Definition for a client instance with a generated `CLI_` id.
    pub fn client(name: impl Into<String>) -> Self {
        Self::new(name, ids::new_client_id())
    }
}

/// Segments scoping a method's request channel (a room, a node, ...).
///
/// Client and server must agree on the topic for a call to be routed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<String>);

impl Topic {
    /// The empty topic: the method's unscoped request channel.
    #[must_use]
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Who answers a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dispatch {
    /// Exactly one server answers.
    Unicast,
    /// Every server registered for the method answers.
    Broadcast,
}

/// Per-method dispatch policy.
///
/// Must be registered identically on the client and on every server of the
/// method. Mismatches are a configuration error the bus cannot detect.
///
/// | Field | Meaning |
/// |-------|---------|
/// | `dispatch` | unicast or broadcast |
/// | `queue` | competing-consumer delivery of the request channel |
/// | `require_claim` | servers bid for the request, the client picks one |
/// | `affinity_enabled` | bids are scored by the handler's affinity function |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodPolicy {
    pub dispatch: Dispatch,
    pub queue: bool,
    pub require_claim: bool,
    pub affinity_enabled: bool,
}

impl MethodPolicy {
    /// Unicast delivered to every server, first reply wins.
    #[must_use]
    pub const fn unicast() -> Self {
        Self {
            dispatch: Dispatch::Unicast,
            queue: false,
            require_claim: false,
            affinity_enabled: false,
        }
    }

    /// Broadcast: every server answers.
    #[must_use]
    pub const fn broadcast() -> Self {
        Self {
            dispatch: Dispatch::Broadcast,
            queue: false,
            require_claim: false,
            affinity_enabled: false,
        }
    }

    #[must_use]
    pub const fn with_queue(mut self) -> Self {
        self.queue = true;
        self
    }

    #[must_use]
    pub const fn with_claim(mut self) -> Self {
        self.require_claim = true;
        self
    }

    /// Enables affinity scoring; implies `require_claim`.
    #[must_use]
    pub const fn with_affinity(mut self) -> Self {
        self.require_claim = true;
        self.affinity_enabled = true;
        self
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.dispatch == Dispatch::Broadcast
    }

    /// Reject combinations that cannot be served.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` naming the conflicting fields.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.require_claim && self.dispatch == Dispatch::Broadcast {
            return Err(RpcError::invalid_argument(
                "require_claim is only valid for unicast methods",
            ));
        }
        if self.require_claim && self.queue {
            return Err(RpcError::invalid_argument(
                "require_claim and queue are mutually exclusive",
            ));
        }
        if self.affinity_enabled && !self.require_claim {
            return Err(RpcError::invalid_argument(
                "affinity_enabled requires require_claim",
            ));
        }
        if self.queue && self.dispatch == Dispatch::Broadcast {
            return Err(RpcError::invalid_argument(
                "broadcast methods cannot use queue delivery",
            ));
        }
        Ok(())
    }
}
