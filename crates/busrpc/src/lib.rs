//! # busrpc
//!
//! Typed RPC over a publish/subscribe message bus. Service instances expose
//! and call methods by name without addressing each other directly:
//!
//! - **Unicast**: one server answers. With `queue` delivery the bus picks the
//!   server; with `require_claim` the servers bid and the client picks one.
//! - **Broadcast**: every server answers; the caller receives a stream of
//!   per-server results.
//! - **Streams**: long-lived bidirectional sessions keyed by a stream id.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   request channel    ┌──────────────┐
//! │  RpcClient   │ ───────────────────▶ │  RpcServer   │
//! │              │ ◀─────────────────── │  handlers    │
//! └──────┬───────┘   reply channel      └──────┬───────┘
//!        │                                     │
//!        └────────────── MessageBus ───────────┘
//!          (LocalMessageBus, or a broker backend)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let bus: Arc<dyn MessageBus> = Arc::new(LocalMessageBus::new());
//!
//! let server = RpcServer::new(ServiceDefinition::server("calc"), bus.clone());
//! server.register_method("add_one", MethodPolicy::unicast().with_queue())?;
//! server
//!     .register_handler("add_one", |_info, n: u64| async move { Ok(n + 1) }, HandlerOptions::default())
//!     .await?;
//!
//! let client = RpcClient::new(ServiceDefinition::client("calc"), bus);
//! client.register_method("add_one", MethodPolicy::unicast().with_queue())?;
//! let two: u64 = client.request_single("add_one", &1u64, RequestOptions::default()).await?;
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod channels;
mod claim;
mod client;
mod codec;
pub mod config;
mod registry;
pub mod server;
pub mod stream;

pub use client::{MultiResponse, ResponseStream, RpcClient};
pub use config::{
    ConfigError, PayloadCodec, RequestOptions, RpcConfig, SelectionOptions,
    DEFAULT_CLIENT_TIMEOUT, MAX_TIMEOUT,
};
pub use server::{AffinityFn, HandlerOptions, Next, RpcInfo, RpcServer, ServerInterceptor};
pub use stream::RpcStream;

pub use busrpc_bus::{Channel, LocalMessageBus, MessageBus, RoutingMode};
pub use busrpc_types::{
    Dispatch, ErrorCode, MethodPolicy, RpcError, RpcResult, ServiceDefinition, Topic,
};
