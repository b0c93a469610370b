// Per-topic subscription bucket for the bus-backed manager

use crate::connection::HubConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Local members of one bus topic (a group or a user stream) together with
/// the state driving the topic's subscribe and unsubscribe transitions.
///
/// The lock guards the member set and the 0-to-1 / 1-to-0 subscription
/// transitions. A bucket that empties is marked retired before it is pruned
/// from the parent map; a join that lands on a retired bucket must retry
/// against the map.
pub struct SubscriptionBucket {
    topic: String,
    state: Mutex<BucketState>,
}

#[derive(Default)]
pub struct BucketState {
    pub members: HashMap<String, Arc<dyn HubConnection>>,
    pub retired: bool,
}

impl SubscriptionBucket {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: Mutex::new(BucketState::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().await
    }

    /// Snapshot of the bucket's members.
    pub async fn members(&self) -> Vec<Arc<dyn HubConnection>> {
        self.state.lock().await.members.values().cloned().collect()
    }
}
