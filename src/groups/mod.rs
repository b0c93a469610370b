// Group membership registries

pub mod bucket;

pub use bucket::SubscriptionBucket;

use crate::connection::HubConnection;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Mapping of group name to the connections hosted on this server.
///
/// Group names are case-insensitive; connection ids are compared exactly.
/// Only local connections ever appear here.
#[derive(Default)]
pub struct GroupRegistry {
    groups: DashMap<String, HashMap<String, Arc<dyn HubConnection>>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a membership, creating the bucket on first use. Adding the
    /// same membership twice is a no-op.
    pub fn add(&self, connection: Arc<dyn HubConnection>, group_name: &str) {
        let key = group_name.to_lowercase();
        let connection_id = connection.connection_id().to_string();
        self.groups
            .entry(key)
            .or_default()
            .insert(connection_id, connection);
    }

    /// Remove a membership, discarding the bucket once it empties.
    pub fn remove(&self, connection_id: &str, group_name: &str) {
        let key = group_name.to_lowercase();
        let emptied = match self.groups.get_mut(&key) {
            Some(mut members) => {
                members.remove(connection_id);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            self.groups.remove_if(&key, |_, members| members.is_empty());
        }
    }

    /// Remove a departing connection from every group it is in.
    pub fn remove_disconnected(&self, connection_id: &str) {
        let mut emptied = Vec::new();
        for mut entry in self.groups.iter_mut() {
            if entry.value_mut().remove(connection_id).is_some() && entry.value().is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for key in emptied {
            self.groups.remove_if(&key, |_, members| members.is_empty());
        }
    }

    /// Snapshot of a group's local members.
    pub fn lookup(&self, group_name: &str) -> Vec<Arc<dyn HubConnection>> {
        match self.groups.get(&group_name.to_lowercase()) {
            Some(members) => members.values().cloned().collect(),
            None => Vec::new(),
        }
    }
}
