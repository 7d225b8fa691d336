//! # In-Process Message Bus
//!
//! Backend for single-process deployments and tests. Distributed deployments
//! implement [`MessageBus`] over a broker instead.
//!
//! A full subscriber buffer blocks the publisher rather than dropping, but
//! every other subscriber of the same message is served without waiting for
//! the slow one.

use crate::channel::{Channel, RoutingMode};
use crate::contract::{BusError, MessageBus, RawSubscription, Unsubscribe};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

type Topics = Mutex<HashMap<String, TopicSubscribers>>;

#[derive(Default)]
struct TopicSubscribers {
    fanout: Vec<(u64, mpsc::Sender<Bytes>)>,
    queue: Vec<(u64, mpsc::Sender<Bytes>)>,
    /// Round-robin cursor over `queue`.
    next_queue: usize,
}

impl TopicSubscribers {
    fn is_empty(&self) -> bool {
        self.fanout.is_empty() && self.queue.is_empty()
    }

    fn prune_closed(&mut self) {
        self.fanout.retain(|(_, tx)| !tx.is_closed());
        self.queue.retain(|(_, tx)| !tx.is_closed());
    }

    /// Every fanout sender plus the next queue sender in rotation.
    fn targets(&mut self) -> Vec<mpsc::Sender<Bytes>> {
        self.prune_closed();
        let mut targets: Vec<_> = self.fanout.iter().map(|(_, tx)| tx.clone()).collect();
        if !self.queue.is_empty() {
            let index = self.next_queue % self.queue.len();
            self.next_queue = index + 1;
            targets.push(self.queue[index].1.clone());
        }
        targets
    }
}

/// In-memory implementation of the message bus.
pub struct LocalMessageBus {
    mode: RoutingMode,
    topics: Arc<Topics>,
    next_subscription: AtomicU64,
    messages_published: AtomicU64,
}

impl LocalMessageBus {
    /// Bus routing on legacy channel names.
    #[must_use]
    pub fn new() -> Self {
        Self::with_mode(RoutingMode::Legacy)
    }

    #[must_use]
    pub fn with_mode(mode: RoutingMode) -> Self {
        Self {
            mode,
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// Live subscriptions (fanout and queue) on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        let mut topics = self.topics.lock();
        topics
            .get_mut(channel.resolve(self.mode))
            .map(|subs| {
                subs.prune_closed();
                subs.fanout.len() + subs.queue.len()
            })
            .unwrap_or(0)
    }

    /// Topics with at least one live subscription.
    #[must_use]
    pub fn active_topics(&self) -> usize {
        let mut topics = self.topics.lock();
        topics
            .values_mut()
            .map(|subs| {
                subs.prune_closed();
                !subs.is_empty()
            })
            .filter(|live| *live)
            .count()
    }

    /// Total messages published since creation.
    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    fn add_subscriber(&self, channel: &Channel, buffer_size: usize, queue: bool) -> RawSubscription {
        let topic = channel.resolve(self.mode).to_string();
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer_size.max(1));

        {
            let mut topics = self.topics.lock();
            let subs = topics.entry(topic.clone()).or_default();
            if queue {
                subs.queue.push((id, tx));
            } else {
                subs.fanout.push((id, tx));
            }
        }

        debug!(topic = %topic, subscription = id, queue, "Local subscription created");

        RawSubscription::new(
            rx,
            Box::new(LocalUnsubscribe {
                topics: Arc::downgrade(&self.topics),
                topic,
                id,
            }),
        )
    }
}

impl Default for LocalMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for LocalMessageBus {
    async fn publish(&self, channel: &Channel, message: Bytes) -> Result<(), BusError> {
        let topic = channel.resolve(self.mode);
        self.messages_published.fetch_add(1, Ordering::Relaxed);

        let targets = {
            let mut topics = self.topics.lock();
            match topics.get_mut(topic) {
                Some(subs) => subs.targets(),
                None => Vec::new(),
            }
        };

        trace!(topic = %topic, receivers = targets.len(), "Local publish");

        // A send fails only when the receiver is gone, which is not an error
        // for the publisher.
        join_all(targets.iter().map(|tx| tx.send(message.clone()))).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &Channel,
        buffer_size: usize,
    ) -> Result<RawSubscription, BusError> {
        Ok(self.add_subscriber(channel, buffer_size, false))
    }

    async fn subscribe_queue(
        &self,
        channel: &Channel,
        buffer_size: usize,
    ) -> Result<RawSubscription, BusError> {
        Ok(self.add_subscriber(channel, buffer_size, true))
    }
}

struct LocalUnsubscribe {
    topics: Weak<Topics>,
    topic: String,
    id: u64,
}

impl Unsubscribe for LocalUnsubscribe {
    fn unsubscribe(&self) -> Result<(), BusError> {
        let Some(topics) = self.topics.upgrade() else {
            return Ok(());
        };
        let mut topics = topics.lock();
        if let Some(subs) = topics.get_mut(&self.topic) {
            subs.fanout.retain(|(id, _)| *id != self.id);
            subs.queue.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                topics.remove(&self.topic);
            }
        }
        debug!(topic = %self.topic, subscription = self.id, "Local subscription removed");
        Ok(())
    }
}
