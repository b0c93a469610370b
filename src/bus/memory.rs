// In-process broker
//
// Topic fan-out over in-memory subscriber tables. Each cooperating server
// connects once and holds its own subscription set, so several managers in
// one process exercise the same publish/subscribe surface a networked
// broker would provide.

use crate::bus::{BusHandler, MessageBus};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Subscription {
    subscriber_id: u64,
    handler: BusHandler,
}

/// Shared in-process topic broker.
pub struct InMemoryBroker {
    subscriptions: DashMap<String, Vec<Subscription>>,
    next_subscriber_id: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: DashMap::new(),
            next_subscriber_id: AtomicU64::new(0),
        })
    }

    /// Open a subscriber handle onto this broker.
    pub fn connect(self: &Arc<Self>) -> Arc<InMemoryBusConnection> {
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!("bus subscriber {} connected", subscriber_id);
        Arc::new(InMemoryBusConnection {
            broker: Arc::clone(self),
            subscriber_id,
            topics: Mutex::new(HashSet::new()),
        })
    }

    fn deliver(&self, topic: &str, payload: Bytes) {
        let handlers: Vec<BusHandler> = match self.subscriptions.get(topic) {
            Some(entry) => entry.iter().map(|s| Arc::clone(&s.handler)).collect(),
            None => return,
        };
        tracing::trace!(
            "delivering {} bytes on {} to {} subscribers",
            payload.len(),
            topic,
            handlers.len()
        );
        for handler in handlers {
            let topic = topic.to_string();
            let payload = payload.clone();
            tokio::spawn(handler(topic, payload));
        }
    }

    fn add_subscription(&self, subscriber_id: u64, topic: &str, handler: BusHandler) {
        let mut entry = self.subscriptions.entry(topic.to_string()).or_default();
        match entry.iter().position(|s| s.subscriber_id == subscriber_id) {
            Some(index) => entry[index].handler = handler,
            None => entry.push(Subscription {
                subscriber_id,
                handler,
            }),
        }
    }

    fn drop_subscription(&self, subscriber_id: u64, topic: &str) {
        let emptied = match self.subscriptions.get_mut(topic) {
            Some(mut entry) => {
                entry.retain(|s| s.subscriber_id != subscriber_id);
                entry.is_empty()
            }
            None => false,
        };
        if emptied {
            self.subscriptions
                .remove_if(topic, |_, subscribers| subscribers.is_empty());
        }
    }
}

/// One server's handle onto an [`InMemoryBroker`].
pub struct InMemoryBusConnection {
    broker: Arc<InMemoryBroker>,
    subscriber_id: u64,
    topics: Mutex<HashSet<String>>,
}

#[async_trait]
impl MessageBus for InMemoryBusConnection {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.broker.deliver(topic, payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<()> {
        self.broker
            .add_subscription(self.subscriber_id, topic, handler);
        self.topics.lock().insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.broker.drop_subscription(self.subscriber_id, topic);
        self.topics.lock().remove(topic);
        Ok(())
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        let topics: Vec<String> = self.topics.lock().drain().collect();
        for topic in topics {
            self.broker.drop_subscription(self.subscriber_id, &topic);
        }
        Ok(())
    }
}
