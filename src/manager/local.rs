// Process-local hub lifetime manager

use crate::connection::{ConnectionRegistry, HubConnection};
use crate::error::Result;
use crate::groups::GroupRegistry;
use crate::manager::{require_argument, HubLifetimeManager};
use crate::protocol::{HubValue, InvocationIdSource, InvocationMessage};
use async_trait::async_trait;
use std::sync::Arc;

/// Single-process fan-out over in-memory connection and group tables.
#[derive(Default)]
pub struct LocalHubLifetimeManager {
    connections: ConnectionRegistry,
    groups: GroupRegistry,
    invocation_ids: InvocationIdSource,
}

impl LocalHubLifetimeManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_invocation(&self, method: &str, arguments: Vec<HubValue>) -> InvocationMessage {
        InvocationMessage::new(self.invocation_ids.next_id(), method, arguments)
    }

    /// Deliver one message to many connections. Per-connection write
    /// failures are logged and swallowed so the remaining recipients still
    /// receive theirs.
    async fn fan_out(
        &self,
        recipients: Vec<Arc<dyn HubConnection>>,
        message: InvocationMessage,
        excluded_ids: &[String],
    ) {
        let writes = recipients
            .into_iter()
            .filter(|c| !excluded_ids.iter().any(|id| id == c.connection_id()))
            .map(|connection| {
                let message = message.clone();
                async move {
                    if let Err(e) = connection.write(message).await {
                        tracing::warn!(
                            "write to connection {} failed: {}",
                            connection.connection_id(),
                            e
                        );
                    }
                }
            });
        futures::future::join_all(writes).await;
    }
}

#[async_trait]
impl HubLifetimeManager for LocalHubLifetimeManager {
    async fn on_connected(&self, connection: Arc<dyn HubConnection>) -> Result<()> {
        self.connections.add(connection);
        Ok(())
    }

    async fn on_disconnected(&self, connection: Arc<dyn HubConnection>) -> Result<()> {
        let connection_id = connection.connection_id();
        self.connections.remove(connection_id);
        self.groups.remove_disconnected(connection_id);
        Ok(())
    }

    async fn invoke_all(&self, method: &str, arguments: Vec<HubValue>) -> Result<()> {
        require_argument(method, "method")?;
        let message = self.next_invocation(method, arguments);
        self.fan_out(self.connections.snapshot(), message, &[]).await;
        Ok(())
    }

    async fn invoke_all_except(
        &self,
        method: &str,
        arguments: Vec<HubValue>,
        excluded_ids: &[String],
    ) -> Result<()> {
        require_argument(method, "method")?;
        let message = self.next_invocation(method, arguments);
        self.fan_out(self.connections.snapshot(), message, excluded_ids)
            .await;
        Ok(())
    }

    async fn invoke_connection(
        &self,
        connection_id: &str,
        method: &str,
        arguments: Vec<HubValue>,
    ) -> Result<()> {
        require_argument(connection_id, "connection_id")?;
        require_argument(method, "method")?;
        // Unknown ids are dropped silently; the caller cannot distinguish an
        // unknown id from a silent drop.
        let Some(connection) = self.connections.lookup(connection_id) else {
            return Ok(());
        };
        connection.write(self.next_invocation(method, arguments)).await
    }

    async fn invoke_group(
        &self,
        group_name: &str,
        method: &str,
        arguments: Vec<HubValue>,
    ) -> Result<()> {
        require_argument(group_name, "group_name")?;
        require_argument(method, "method")?;
        let message = self.next_invocation(method, arguments);
        self.fan_out(self.groups.lookup(group_name), message, &[])
            .await;
        Ok(())
    }

    async fn invoke_group_except(
        &self,
        group_name: &str,
        method: &str,
        arguments: Vec<HubValue>,
        excluded_ids: &[String],
    ) -> Result<()> {
        require_argument(group_name, "group_name")?;
        require_argument(method, "method")?;
        let message = self.next_invocation(method, arguments);
        self.fan_out(self.groups.lookup(group_name), message, excluded_ids)
            .await;
        Ok(())
    }

    async fn invoke_user(
        &self,
        user_id: &str,
        method: &str,
        arguments: Vec<HubValue>,
    ) -> Result<()> {
        require_argument(user_id, "user_id")?;
        require_argument(method, "method")?;
        let recipients = self
            .connections
            .snapshot()
            .into_iter()
            .filter(|c| c.user_id() == Some(user_id))
            .collect();
        let message = self.next_invocation(method, arguments);
        self.fan_out(recipients, message, &[]).await;
        Ok(())
    }

    async fn add_to_group(&self, connection_id: &str, group_name: &str) -> Result<()> {
        require_argument(connection_id, "connection_id")?;
        require_argument(group_name, "group_name")?;
        if let Some(connection) = self.connections.lookup(connection_id) {
            self.groups.add(connection, group_name);
        }
        Ok(())
    }

    async fn remove_from_group(&self, connection_id: &str, group_name: &str) -> Result<()> {
        require_argument(connection_id, "connection_id")?;
        require_argument(group_name, "group_name")?;
        if self.connections.lookup(connection_id).is_some() {
            self.groups.remove(connection_id, group_name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingConnection;
    use crate::error::HubError;

    async fn manager_with(
        connections: &[Arc<RecordingConnection>],
    ) -> LocalHubLifetimeManager {
        let manager = LocalHubLifetimeManager::new();
        for connection in connections {
            manager
                .on_connected(connection.clone() as Arc<dyn HubConnection>)
                .await
                .unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn invoke_all_writes_once_to_every_connection() {
        let a = RecordingConnection::new("a");
        let b = RecordingConnection::new("b");
        let c = RecordingConnection::new("c");
        let manager = manager_with(&[a.clone(), b.clone(), c.clone()]).await;

        manager
            .invoke_all("Echo", vec![HubValue::from("hi")])
            .await
            .unwrap();

        for connection in [&a, &b, &c] {
            let written = connection.written.lock();
            assert_eq!(written.len(), 1);
            assert_eq!(written[0].target, "Echo");
            assert_eq!(written[0].arguments, vec![HubValue::from("hi")]);
            assert!(written[0].non_blocking);
        }
    }

    #[tokio::test]
    async fn invoke_all_except_skips_the_excluded_ids() {
        let a = RecordingConnection::new("a");
        let b = RecordingConnection::new("b");
        let c = RecordingConnection::new("c");
        let manager = manager_with(&[a.clone(), b.clone(), c.clone()]).await;

        manager
            .invoke_all_except("Echo", vec![], &["b".to_string()])
            .await
            .unwrap();

        assert_eq!(a.written.lock().len(), 1);
        assert!(b.written.lock().is_empty());
        assert_eq!(c.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn a_failing_sink_does_not_abort_the_fan_out() {
        let bad = RecordingConnection::failing("bad");
        let good = RecordingConnection::new("good");
        let manager = manager_with(&[bad, good.clone()]).await;

        manager.invoke_all("Echo", vec![]).await.unwrap();

        assert_eq!(good.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn group_membership_drives_group_invokes() {
        let a = RecordingConnection::new("a");
        let b = RecordingConnection::new("b");
        let manager = manager_with(&[a.clone(), b.clone()]).await;

        manager.add_to_group("a", "Chat").await.unwrap();
        manager.add_to_group("a", "chat").await.unwrap();
        manager.invoke_group("CHAT", "Ping", vec![]).await.unwrap();

        assert_eq!(a.written.lock().len(), 1);
        assert!(b.written.lock().is_empty());

        manager.remove_from_group("a", "chat").await.unwrap();
        manager.invoke_group("chat", "Ping", vec![]).await.unwrap();
        assert_eq!(a.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn group_mutations_ignore_unknown_connections() {
        let manager = manager_with(&[]).await;
        manager.add_to_group("ghost", "g").await.unwrap();
        manager.remove_from_group("ghost", "g").await.unwrap();
        manager.invoke_group("g", "Ping", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn invoke_user_matches_user_ids_exactly() {
        let alice = RecordingConnection::with_user("a", "Alice");
        let lower = RecordingConnection::with_user("b", "alice");
        let manager = manager_with(&[alice.clone(), lower.clone()]).await;

        manager.invoke_user("Alice", "Ping", vec![]).await.unwrap();

        assert_eq!(alice.written.lock().len(), 1);
        assert!(lower.written.lock().is_empty());
    }

    #[tokio::test]
    async fn disconnected_connections_receive_nothing() {
        let a = RecordingConnection::new("a");
        let manager = manager_with(&[a.clone()]).await;
        manager.add_to_group("a", "g").await.unwrap();

        manager
            .on_disconnected(a.clone() as Arc<dyn HubConnection>)
            .await
            .unwrap();

        manager.invoke_all("Echo", vec![]).await.unwrap();
        manager.invoke_connection("a", "Echo", vec![]).await.unwrap();
        manager.invoke_group("g", "Echo", vec![]).await.unwrap();

        assert!(a.written.lock().is_empty());
    }

    #[tokio::test]
    async fn empty_required_arguments_are_rejected() {
        let manager = manager_with(&[]).await;

        let err = manager.add_to_group("", "g").await.unwrap_err();
        assert!(matches!(err, HubError::InvalidArgument(_)));

        let err = manager.invoke_group("", "Ping", vec![]).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidArgument(_)));

        let err = manager.invoke_all("", vec![]).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn plural_operations_cover_each_target() {
        let a = RecordingConnection::new("a");
        let b = RecordingConnection::new("b");
        let manager = manager_with(&[a.clone(), b.clone()]).await;

        manager
            .invoke_connections(&["a".to_string(), "b".to_string()], "Ping", vec![])
            .await
            .unwrap();

        assert_eq!(a.written.lock().len(), 1);
        assert_eq!(b.written.lock().len(), 1);
    }
}
