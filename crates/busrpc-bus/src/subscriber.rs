//! # Typed Subscriptions
//!
//! Decoding wrappers over the raw contract. Messages that fail to decode are
//! logged and skipped so a single malformed publish cannot stall a consumer.

use crate::channel::Channel;
use crate::codec;
use crate::contract::{BusError, MessageBus, RawSubscription};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_stream::Stream;
use tracing::{debug, warn};

/// Encode `message` and publish it on `channel`.
///
/// # Errors
///
/// Encoding failures and backend publish failures.
pub async fn publish<T: Serialize>(
    bus: &dyn MessageBus,
    channel: &Channel,
    message: &T,
) -> Result<(), BusError> {
    let bytes = codec::encode(message)?;
    bus.publish(channel, bytes).await
}

/// Fanout subscription decoding messages as `T`.
///
/// # Errors
///
/// Backend subscribe failures.
pub async fn subscribe<T: DeserializeOwned>(
    bus: &dyn MessageBus,
    channel: &Channel,
    buffer_size: usize,
) -> Result<Subscription<T>, BusError> {
    let raw = bus.subscribe(channel, buffer_size).await?;
    debug!(channel = %channel, "Subscribed");
    Ok(Subscription::new(raw, channel))
}

/// Queue subscription decoding messages as `T`.
///
/// # Errors
///
/// Backend subscribe failures.
pub async fn subscribe_queue<T: DeserializeOwned>(
    bus: &dyn MessageBus,
    channel: &Channel,
    buffer_size: usize,
) -> Result<Subscription<T>, BusError> {
    let raw = bus.subscribe_queue(channel, buffer_size).await?;
    debug!(channel = %channel, "Queue subscribed");
    Ok(Subscription::new(raw, channel))
}

/// A typed, closable, ordered consumer of one channel.
///
/// When dropped, the subscription is closed at the backend.
pub struct Subscription<T> {
    raw: RawSubscription,
    channel: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Subscription<T> {
    fn new(raw: RawSubscription, channel: &Channel) -> Self {
        Self {
            raw,
            channel: channel.to_string(),
            _marker: PhantomData,
        }
    }

    /// Name of the subscribed channel, for diagnostics.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.raw.is_closed()
    }

    /// Stop receiving. Idempotent and non-blocking.
    pub fn close(&mut self) -> Result<(), BusError> {
        if !self.raw.is_closed() {
            debug!(channel = %self.channel, "Subscription closed");
        }
        self.raw.close()
    }
}

impl<T: DeserializeOwned> Subscription<T> {
    /// Receive the next decodable message.
    ///
    /// # Returns
    ///
    /// - `Some(message)` - the next message in bus order
    /// - `None` - the subscription was closed
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let bytes = self.raw.recv().await?;
            match codec::decode(&bytes) {
                Ok(message) => return Some(message),
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "Dropping undecodable message");
                }
            }
        }
    }
}

impl<T: DeserializeOwned> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.raw.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => match codec::decode(&bytes) {
                    Ok(message) => return Poll::Ready(Some(message)),
                    Err(e) => {
                        warn!(channel = %this.channel, error = %e, "Dropping undecodable message");
                    }
                },
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
