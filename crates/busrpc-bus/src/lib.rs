//! # busrpc Bus - Message Bus Contract
//!
//! The publish/subscribe primitive every other busrpc component depends on.
//!
//! ## Delivery Modes
//!
//! ```text
//!                 fanout                          queue
//!            ┌──────────────┐               ┌──────────────┐
//! publish ──▶│   channel    │    publish ──▶│   channel    │
//!            └──┬────┬────┬─┘               └──────┬───────┘
//!               ▼    ▼    ▼                        ▼
//!             sub  sub  sub                 one of the queue subs
//! ```
//!
//! ## Contract
//!
//! - Delivery is at-least-once and unordered between publishers.
//! - Messages within one subscription keep bus order.
//! - Each subscription owns a bounded buffer; backends decide whether a full
//!   buffer blocks the publisher or drops. The RPC layer assumes blocking.
//! - `close()` is idempotent and never blocks; afterwards the subscription
//!   reports end-of-sequence immediately.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod channel;
pub mod codec;
pub mod contract;
pub mod local;
pub mod subscriber;

pub use channel::{Channel, RoutingMode};
pub use contract::{BusError, MessageBus, RawSubscription, Unsubscribe};
pub use local::LocalMessageBus;
pub use subscriber::{publish, subscribe, subscribe_queue, Subscription};

/// Default per-subscription buffer size.
pub const DEFAULT_CHANNEL_SIZE: usize = 100;
