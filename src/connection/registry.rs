// Process-local connection index

use crate::connection::HubConnection;
use dashmap::DashMap;
use std::sync::Arc;

/// Index of the live connections hosted on this server, keyed by
/// connection id.
///
/// Backed by a sharded map so fan-out can snapshot the connection set
/// without blocking concurrent connect and disconnect traffic.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<dyn HubConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Re-adding an id replaces the previous entry;
    /// a colliding id is a caller bug but must not corrupt iteration.
    pub fn add(&self, connection: Arc<dyn HubConnection>) {
        self.connections
            .insert(connection.connection_id().to_string(), connection);
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<dyn HubConnection>> {
        self.connections.remove(connection_id).map(|(_, c)| c)
    }

    pub fn lookup(&self, connection_id: &str) -> Option<Arc<dyn HubConnection>> {
        self.connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Stable snapshot of the current connection set.
    pub fn snapshot(&self) -> Vec<Arc<dyn HubConnection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
