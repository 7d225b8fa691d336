//! # RPC Configuration
//!
//! Process-wide defaults for clients and servers, plus the per-call options
//! that override them.
//!
//! All timeouts have sane defaults with override capability, either in code or
//! through `BUSRPC_*` environment variables.

use busrpc_types::Topic;
use std::env;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default deadline for unicast calls and stream round trips.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default claim window.
pub const DEFAULT_AFFINITY_TIMEOUT: Duration = Duration::from_millis(300);

/// Default extra wait after the first acceptable claim offer.
pub const DEFAULT_SHORT_CIRCUIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Default settle window after the first broadcast responder ack.
pub const DEFAULT_RESPONDER_WINDOW: Duration = Duration::from_millis(100);

/// Upper bound for every timeout and window, configured or per call.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(86_400 * 365);

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must not exceed {max_ms}ms")]
    TooLong { field: &'static str, max_ms: u128 },

    #[error("affinity timeout ({affinity_ms}ms) must not exceed the request timeout ({request_ms}ms)")]
    AffinityExceedsRequest { affinity_ms: u128, request_ms: u128 },

    #[error("minimum affinity must be within [0, 1], got {0}")]
    MinimumAffinity(String),

    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Encoding of request and response payloads. Peers must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadCodec {
    /// Compact binary encoding.
    #[default]
    Bincode,
    /// Human readable, for debugging traffic on a broker.
    Json,
}

/// How a client picks the winner of a claim negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionOptions {
    /// Offers scoring below this are ignored.
    pub minimum_affinity: f32,
    /// Take the first acceptable offer instead of waiting for the best.
    pub accept_first_available: bool,
    /// Length of the claim window.
    pub affinity_timeout: Duration,
    /// Once an acceptable offer arrived, wait at most this much longer.
    pub short_circuit_timeout: Duration,
    /// Close the window as soon as this many offers (accepting or declining)
    /// arrived, when the number of capable servers is known.
    pub expected_offers: Option<usize>,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            minimum_affinity: 0.0,
            accept_first_available: false,
            affinity_timeout: DEFAULT_AFFINITY_TIMEOUT,
            short_circuit_timeout: DEFAULT_SHORT_CIRCUIT_TIMEOUT,
            expected_offers: None,
        }
    }
}

/// Client and server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcConfig {
    /// Deadline for unicast calls, broadcast collection and stream opens.
    pub request_timeout: Duration,
    /// Buffer size of every subscription created by the dispatcher.
    pub channel_size: usize,
    /// Broadcast: settle window after the first responder ack.
    pub responder_window: Duration,
    /// Streams: how long `send` waits for the peer's ack.
    pub stream_ack_timeout: Duration,
    pub selection: SelectionOptions,
    pub payload_codec: PayloadCodec,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_CLIENT_TIMEOUT,
            channel_size: busrpc_bus::DEFAULT_CHANNEL_SIZE,
            responder_window: DEFAULT_RESPONDER_WINDOW,
            stream_ack_timeout: DEFAULT_CLIENT_TIMEOUT,
            selection: SelectionOptions::default(),
            payload_codec: PayloadCodec::default(),
        }
    }
}

fn env_millis(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}

impl RpcConfig {
    /// Create configuration from environment variables over the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `BUSRPC_REQUEST_TIMEOUT_MS` (default: 3000)
    /// - `BUSRPC_CHANNEL_SIZE` (default: 100)
    /// - `BUSRPC_RESPONDER_WINDOW_MS` (default: 100)
    /// - `BUSRPC_STREAM_ACK_TIMEOUT_MS` (default: 3000)
    /// - `BUSRPC_AFFINITY_TIMEOUT_MS` (default: 300)
    /// - `BUSRPC_SHORT_CIRCUIT_TIMEOUT_MS` (default: 100)
    /// - `BUSRPC_PAYLOAD_CODEC`: `bincode` or `json` (default: bincode)
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidEnv` for unparsable values; the result is also
    /// validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(timeout) = env_millis("BUSRPC_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = timeout;
        }
        if let Ok(value) = env::var("BUSRPC_CHANNEL_SIZE") {
            config.channel_size = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "BUSRPC_CHANNEL_SIZE",
                value,
            })?;
        }
        if let Some(window) = env_millis("BUSRPC_RESPONDER_WINDOW_MS")? {
            config.responder_window = window;
        }
        if let Some(timeout) = env_millis("BUSRPC_STREAM_ACK_TIMEOUT_MS")? {
            config.stream_ack_timeout = timeout;
        }
        if let Some(timeout) = env_millis("BUSRPC_AFFINITY_TIMEOUT_MS")? {
            config.selection.affinity_timeout = timeout;
        }
        if let Some(timeout) = env_millis("BUSRPC_SHORT_CIRCUIT_TIMEOUT_MS")? {
            config.selection.short_circuit_timeout = timeout;
        }
        if let Ok(value) = env::var("BUSRPC_PAYLOAD_CODEC") {
            config.payload_codec = match value.to_lowercase().as_str() {
                "bincode" => PayloadCodec::Bincode,
                "json" => PayloadCodec::Json,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "BUSRPC_PAYLOAD_CODEC",
                        value,
                    })
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Zero timeouts or buffer sizes, a claim window longer than the request
    /// timeout, or a minimum affinity outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "request_timeout",
            });
        }
        if self.channel_size == 0 {
            return Err(ConfigError::Zero {
                field: "channel_size",
            });
        }
        if self.stream_ack_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "stream_ack_timeout",
            });
        }
        check_bounded("request_timeout", self.request_timeout)?;
        check_bounded("stream_ack_timeout", self.stream_ack_timeout)?;
        check_bounded("responder_window", self.responder_window)?;
        self.selection.validate()?;
        if self.selection.affinity_timeout > self.request_timeout {
            return Err(ConfigError::AffinityExceedsRequest {
                affinity_ms: self.selection.affinity_timeout.as_millis(),
                request_ms: self.request_timeout.as_millis(),
            });
        }
        Ok(())
    }
}

fn check_bounded(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value > MAX_TIMEOUT {
        return Err(ConfigError::TooLong {
            field,
            max_ms: MAX_TIMEOUT.as_millis(),
        });
    }
    Ok(())
}

impl SelectionOptions {
    /// # Errors
    ///
    /// A zero or unbounded claim window, an unbounded short-circuit window,
    /// or a minimum affinity outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.affinity_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "affinity_timeout",
            });
        }
        check_bounded("affinity_timeout", self.affinity_timeout)?;
        check_bounded("short_circuit_timeout", self.short_circuit_timeout)?;
        if !(0.0..=1.0).contains(&self.minimum_affinity) {
            return Err(ConfigError::MinimumAffinity(
                self.minimum_affinity.to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-call overrides. Unset fields fall back to the [`RpcConfig`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub topic: Topic,
    pub selection: Option<SelectionOptions>,
    /// Cancelling the token cancels the call.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = topic;
        self
    }

    #[must_use]
    pub fn with_selection(mut self, selection: SelectionOptions) -> Self {
        self.selection = Some(selection);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Validate the overrides that are set.
    ///
    /// # Errors
    ///
    /// A zero or unbounded timeout, or invalid selection options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(ConfigError::Zero { field: "timeout" });
            }
            check_bounded("timeout", timeout)?;
        }
        if let Some(selection) = &self.selection {
            selection.validate()?;
        }
        Ok(())
    }
}
