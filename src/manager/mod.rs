// Hub lifetime managers
//
// The manager is the composition root that routes invocations from
// server-side application code to the connections that should receive them.
// Two interchangeable implementations exist: a process-local one and one
// backed by a pub/sub bus for fleets of cooperating servers.

pub mod distributed;
pub mod local;

pub use distributed::BusHubLifetimeManager;
pub use local::LocalHubLifetimeManager;

use crate::connection::HubConnection;
use crate::error::{HubError, Result};
use crate::protocol::HubValue;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a hub lifetime manager.
#[derive(Debug, Clone)]
pub struct HubManagerConfig {
    /// How long a cross-server group mutation waits for its acknowledgement
    /// before completing anyway.
    pub ack_timeout: Duration,
}

impl Default for HubManagerConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
        }
    }
}

/// Routes invocations from server-side application code to the connections
/// that should receive them, wherever in the fleet they live.
///
/// Operations complete when local delivery and the broker publish have been
/// issued, not when remote delivery is observed.
#[async_trait]
pub trait HubLifetimeManager: Send + Sync {
    /// Register a freshly handshaken connection.
    async fn on_connected(&self, connection: Arc<dyn HubConnection>) -> Result<()>;

    /// Deregister a departing connection and release everything held on its
    /// behalf.
    async fn on_disconnected(&self, connection: Arc<dyn HubConnection>) -> Result<()>;

    /// Invoke a client method on every connection in the fleet.
    async fn invoke_all(&self, method: &str, arguments: Vec<HubValue>) -> Result<()>;

    /// Invoke on every connection except the given connection ids.
    async fn invoke_all_except(
        &self,
        method: &str,
        arguments: Vec<HubValue>,
        excluded_ids: &[String],
    ) -> Result<()>;

    /// Invoke on exactly one connection.
    async fn invoke_connection(
        &self,
        connection_id: &str,
        method: &str,
        arguments: Vec<HubValue>,
    ) -> Result<()>;

    /// Invoke on every current member of a group.
    async fn invoke_group(
        &self,
        group_name: &str,
        method: &str,
        arguments: Vec<HubValue>,
    ) -> Result<()>;

    /// Invoke on a group's members minus the given connection ids.
    async fn invoke_group_except(
        &self,
        group_name: &str,
        method: &str,
        arguments: Vec<HubValue>,
        excluded_ids: &[String],
    ) -> Result<()>;

    /// Invoke on every connection authenticated as the given user. User ids
    /// compare exactly.
    async fn invoke_user(
        &self,
        user_id: &str,
        method: &str,
        arguments: Vec<HubValue>,
    ) -> Result<()>;

    /// Add a connection to a group, wherever the connection lives.
    async fn add_to_group(&self, connection_id: &str, group_name: &str) -> Result<()>;

    /// Remove a connection from a group, wherever the connection lives.
    async fn remove_from_group(&self, connection_id: &str, group_name: &str) -> Result<()>;

    /// Invoke on each of the given connections.
    async fn invoke_connections(
        &self,
        connection_ids: &[String],
        method: &str,
        arguments: Vec<HubValue>,
    ) -> Result<()> {
        for connection_id in connection_ids {
            self.invoke_connection(connection_id, method, arguments.clone())
                .await?;
        }
        Ok(())
    }

    /// Invoke on the members of each of the given groups.
    async fn invoke_groups(
        &self,
        group_names: &[String],
        method: &str,
        arguments: Vec<HubValue>,
    ) -> Result<()> {
        for group_name in group_names {
            self.invoke_group(group_name, method, arguments.clone())
                .await?;
        }
        Ok(())
    }

    /// Invoke on the connections of each of the given users.
    async fn invoke_users(
        &self,
        user_ids: &[String],
        method: &str,
        arguments: Vec<HubValue>,
    ) -> Result<()> {
        for user_id in user_ids {
            self.invoke_user(user_id, method, arguments.clone()).await?;
        }
        Ok(())
    }
}

pub(crate) fn require_argument(value: &str, name: &str) -> Result<()> {
    if value.is_empty() {
        return Err(HubError::InvalidArgument(format!(
            "{} must not be empty",
            name
        )));
    }
    Ok(())
}
