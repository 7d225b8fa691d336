//! # Channel Descriptor
//!
//! A channel names one logical topic twice: a flat legacy name for backends
//! without hierarchical routing, and a structured name for backends with it.
//! Which one a backend uses is fixed when the backend is constructed.

use std::fmt;

/// Which field of a [`Channel`] a backend routes on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RoutingMode {
    /// Flat `|`-separated names.
    #[default]
    Legacy,
    /// Hierarchical `.`-separated names.
    Structured,
}

/// Addressing descriptor passed to every bus operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    pub legacy: String,
    pub server: String,
}

impl Channel {
    pub fn new(legacy: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            legacy: legacy.into(),
            server: server.into(),
        }
    }

    /// Channel whose two names are the same string.
    pub fn single(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            legacy: name.clone(),
            server: name,
        }
    }

    /// The concrete topic for a backend routing in `mode`.
    #[must_use]
    pub fn resolve(&self, mode: RoutingMode) -> &str {
        match mode {
            RoutingMode::Legacy => &self.legacy,
            RoutingMode::Structured => &self.server,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.legacy)
    }
}
