// Pub/sub broker abstraction

pub mod memory;

pub use memory::{InMemoryBroker, InMemoryBusConnection};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Callback invoked for every payload delivered on a subscribed topic.
///
/// The broker may invoke handlers concurrently from arbitrary worker tasks;
/// subscribers must tolerate that.
pub type BusHandler = Arc<dyn Fn(String, Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Thin abstraction over the pub/sub broker used for inter-server traffic.
///
/// Publishing is fire-and-forget; the broker's own delivery guarantee is
/// accepted as-is and nothing is retried at this layer.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload on a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to a topic. Subscribing twice to the same topic replaces
    /// the previous handler.
    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<()>;

    /// Tear down this subscriber's subscription to a topic.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Tear down every subscription held by this subscriber.
    async fn unsubscribe_all(&self) -> Result<()>;
}
