//! # Message Bus Contract
//!
//! The interface every backend implements. Backends hand out
//! [`RawSubscription`]s: a bounded receiver fed by the backend plus an
//! [`Unsubscribe`] handle the backend uses to stop feeding it.

use crate::channel::Channel;
use async_trait::async_trait;
use bytes::Bytes;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from bus operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus or subscription is closed.
    #[error("Message bus closed")]
    Closed,

    /// A message could not be serialized.
    #[error("Encode failed: {0}")]
    Encode(String),

    /// A received message could not be deserialized.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Backend-specific failure (connection lost, broker rejected, ...).
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Publish/subscribe primitive consumed by the RPC layer.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message to every fanout subscriber and one queue subscriber.
    async fn publish(&self, channel: &Channel, message: Bytes) -> Result<(), BusError>;

    /// Fanout subscription: receives every message published on `channel`.
    async fn subscribe(
        &self,
        channel: &Channel,
        buffer_size: usize,
    ) -> Result<RawSubscription, BusError>;

    /// Competing-consumer subscription: each message published on `channel`
    /// reaches exactly one of the queue subscribers.
    async fn subscribe_queue(
        &self,
        channel: &Channel,
        buffer_size: usize,
    ) -> Result<RawSubscription, BusError>;
}

/// Backend hook that stops delivery to a subscription.
pub trait Unsubscribe: Send + Sync {
    /// Stop feeding the subscription. Called at most once.
    fn unsubscribe(&self) -> Result<(), BusError>;
}

/// Undecoded consumer of one channel.
///
/// Owned exclusively by its creator. Dropping it closes it.
pub struct RawSubscription {
    receiver: mpsc::Receiver<Bytes>,
    unsubscribe: Option<Box<dyn Unsubscribe>>,
}

impl RawSubscription {
    pub fn new(receiver: mpsc::Receiver<Bytes>, unsubscribe: Box<dyn Unsubscribe>) -> Self {
        Self {
            receiver,
            unsubscribe: Some(unsubscribe),
        }
    }

    /// Next message in bus order, `None` once closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.receiver.poll_recv(cx)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.unsubscribe.is_none()
    }

    /// Unsubscribe and discard anything still buffered.
    ///
    /// Idempotent; later calls return `Ok(())`. After the first call `recv`
    /// returns `None` without waiting.
    pub fn close(&mut self) -> Result<(), BusError> {
        let Some(unsubscribe) = self.unsubscribe.take() else {
            return Ok(());
        };
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
        unsubscribe.unsubscribe()
    }
}

impl Drop for RawSubscription {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for RawSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSubscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}
