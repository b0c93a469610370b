// Bus-backed hub lifetime manager
//
// Implements the same contract as the local manager on top of a pub/sub
// broker so any server in a fleet can address any connection. Connections
// stay sticky to the server that owns them; this manager fans out through
// bus topics and runs an acknowledged control protocol for group mutations
// that target connections owned by other servers.

use crate::ack::AckTracker;
use crate::bus::{BusHandler, MessageBus};
use crate::connection::{BusFeature, ConnectionRegistry, HubConnection};
use crate::error::Result;
use crate::groups::SubscriptionBucket;
use crate::manager::{require_argument, HubLifetimeManager, HubManagerConfig};
use crate::protocol::{
    ControlEnvelope, GroupAction, HubValue, InvocationEnvelope, InvocationIdSource,
    InvocationMessage, WireCodec,
};
use crate::topics::TopicNames;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use std::sync::{Arc, Weak};

/// Hub lifetime manager backed by a pub/sub bus.
///
/// One instance exists per hub per server and lives for the process. Every
/// server sharing a hub name and a broker forms one fleet. Single-connection
/// sends short-circuit to the local sink when this server owns the target;
/// everything else is published and fanned out by whichever servers hold
/// matching connections.
pub struct BusHubLifetimeManager {
    server_id: String,
    self_ref: Weak<Self>,
    topics: TopicNames,
    bus: Arc<dyn MessageBus>,
    codec: WireCodec,
    connections: ConnectionRegistry,
    /// Group and user buckets, keyed by full bus topic.
    buckets: DashMap<String, Arc<SubscriptionBucket>>,
    acks: AckTracker,
    invocation_ids: InvocationIdSource,
}

impl BusHubLifetimeManager {
    /// Build the manager and establish the server-wide subscriptions: the
    /// broadcast topic, the broadcast-with-exclusions topic, the shared
    /// group control inbox and this server's private ack inbox.
    pub async fn new(
        hub_name: &str,
        bus: Arc<dyn MessageBus>,
        config: HubManagerConfig,
    ) -> Result<Arc<Self>> {
        let server_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!("hub {} joining the bus as server {}", hub_name, server_id);

        let manager = Arc::new_cyclic(|self_ref| Self {
            server_id,
            self_ref: self_ref.clone(),
            topics: TopicNames::new(hub_name),
            bus,
            codec: WireCodec::new(),
            connections: ConnectionRegistry::new(),
            buckets: DashMap::new(),
            acks: AckTracker::new(config.ack_timeout),
            invocation_ids: InvocationIdSource::new(),
        });

        manager
            .bus
            .subscribe(&manager.topics.all(), manager.fleet_handler())
            .await?;
        manager
            .bus
            .subscribe(&manager.topics.all_except(), manager.fleet_handler())
            .await?;
        manager
            .bus
            .subscribe(&manager.topics.group_control(), manager.control_handler())
            .await?;
        manager
            .bus
            .subscribe(
                &manager.topics.server_inbox(&manager.server_id),
                manager.ack_handler(),
            )
            .await?;
        Ok(manager)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Release every bus subscription and complete outstanding acks.
    pub async fn shutdown(&self) {
        self.acks.dispose();
        if let Err(e) = self.bus.unsubscribe_all().await {
            tracing::warn!("failed to release bus subscriptions: {}", e);
        }
    }

    fn next_envelope(
        &self,
        method: &str,
        arguments: Vec<HubValue>,
        excluded_ids: &[String],
    ) -> InvocationEnvelope {
        let message = InvocationMessage::new(self.invocation_ids.next_id(), method, arguments);
        InvocationEnvelope::with_exclusions(message, excluded_ids.to_vec())
    }

    async fn publish_invocation(&self, topic: &str, envelope: &InvocationEnvelope) -> Result<()> {
        let payload = self.codec.encode_invocation(envelope)?;
        tracing::trace!(
            "publishing invocation {} on {}",
            envelope.invocation.invocation_id,
            topic
        );
        self.bus.publish(topic, payload).await
    }

    async fn publish_control(&self, topic: &str, envelope: &ControlEnvelope) -> Result<()> {
        let payload = self.codec.encode_control(envelope)?;
        tracing::trace!(
            "publishing {:?} control {} on {}",
            envelope.action,
            envelope.correlation_id,
            topic
        );
        self.bus.publish(topic, payload).await
    }

    // ------------------------------------------------------------------
    // Bus handlers
    // ------------------------------------------------------------------

    fn fleet_handler(&self) -> BusHandler {
        let manager = self.self_ref.clone();
        Arc::new(move |_topic: String, payload: Bytes| {
            let manager = manager.clone();
            async move {
                let Some(manager) = manager.upgrade() else { return };
                manager.on_fleet_message(payload).await;
            }
            .boxed()
        })
    }

    fn connection_handler(&self, connection: Arc<dyn HubConnection>) -> BusHandler {
        let manager = self.self_ref.clone();
        Arc::new(move |_topic: String, payload: Bytes| {
            let manager = manager.clone();
            let connection = Arc::clone(&connection);
            async move {
                let Some(manager) = manager.upgrade() else { return };
                manager.on_connection_message(connection, payload).await;
            }
            .boxed()
        })
    }

    fn bucket_handler(&self) -> BusHandler {
        let manager = self.self_ref.clone();
        Arc::new(move |topic: String, payload: Bytes| {
            let manager = manager.clone();
            async move {
                let Some(manager) = manager.upgrade() else { return };
                manager.on_bucket_message(&topic, payload).await;
            }
            .boxed()
        })
    }

    fn control_handler(&self) -> BusHandler {
        let manager = self.self_ref.clone();
        Arc::new(move |_topic: String, payload: Bytes| {
            let manager = manager.clone();
            async move {
                let Some(manager) = manager.upgrade() else { return };
                manager.on_control_message(payload).await;
            }
            .boxed()
        })
    }

    fn ack_handler(&self) -> BusHandler {
        let manager = self.self_ref.clone();
        Arc::new(move |_topic: String, payload: Bytes| {
            let manager = manager.clone();
            async move {
                let Some(manager) = manager.upgrade() else { return };
                manager.on_ack_message(payload).await;
            }
            .boxed()
        })
    }

    async fn on_fleet_message(&self, payload: Bytes) {
        let envelope = match self.codec.decode_invocation(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("dropping undecodable invocation: {}", e);
                return;
            }
        };
        self.deliver_local(self.connections.snapshot(), &envelope)
            .await;
    }

    async fn on_connection_message(&self, connection: Arc<dyn HubConnection>, payload: Bytes) {
        let envelope = match self.codec.decode_invocation(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("dropping undecodable invocation: {}", e);
                return;
            }
        };
        if let Err(e) = connection.write(envelope.invocation).await {
            tracing::warn!(
                "write to connection {} failed: {}",
                connection.connection_id(),
                e
            );
        }
    }

    async fn on_bucket_message(&self, topic: &str, payload: Bytes) {
        let envelope = match self.codec.decode_invocation(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("dropping undecodable invocation: {}", e);
                return;
            }
        };
        let Some(bucket) = self.buckets.get(topic).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let members = bucket.members().await;
        self.deliver_local(members, &envelope).await;
    }

    async fn on_control_message(&self, payload: Bytes) {
        let envelope = match self.codec.decode_control(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("dropping undecodable control message: {}", e);
                return;
            }
        };
        match envelope.action {
            GroupAction::Add | GroupAction::Remove => {
                // Exactly one server owns the connection; every other server
                // stays silent so the originator's ack can time out when
                // nobody does.
                let Some(connection) = self.connections.lookup(&envelope.connection_id) else {
                    return;
                };
                let applied = match envelope.action {
                    GroupAction::Add => self.add_group_core(&connection, &envelope.group_name).await,
                    _ => {
                        self.remove_group_core(&connection, &envelope.group_name)
                            .await
                    }
                };
                if let Err(e) = applied {
                    tracing::warn!(
                        "remote group mutation for {} failed: {}",
                        envelope.connection_id,
                        e
                    );
                    return;
                }
                let ack = ControlEnvelope::ack(envelope.correlation_id, &envelope.origin_server);
                let inbox = self.topics.server_inbox(&envelope.origin_server);
                if let Err(e) = self.publish_control(&inbox, &ack).await {
                    tracing::warn!("ack publish to {} failed: {}", inbox, e);
                }
            }
            GroupAction::Ack => {}
        }
    }

    async fn on_ack_message(&self, payload: Bytes) {
        let envelope = match self.codec.decode_control(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("dropping undecodable ack: {}", e);
                return;
            }
        };
        if envelope.action == GroupAction::Ack {
            self.acks.complete(envelope.correlation_id);
        }
    }

    /// Deliver an inbound envelope to local recipients, applying its
    /// exclusions. Write failures are logged per connection and never abort
    /// the rest of the fan-out.
    async fn deliver_local(
        &self,
        recipients: Vec<Arc<dyn HubConnection>>,
        envelope: &InvocationEnvelope,
    ) {
        let writes = recipients
            .into_iter()
            .filter(|c| !envelope.is_excluded(c.connection_id()))
            .map(|connection| {
                let message = envelope.invocation.clone();
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

    // ------------------------------------------------------------------
    // Group plumbing
    // ------------------------------------------------------------------

    /// Local half of a group add. Lock order is the connection's group set
    /// first, then the bucket.
    async fn add_group_core(
        &self,
        connection: &Arc<dyn HubConnection>,
        group_name: &str,
    ) -> Result<()> {
        let feature = connection.features().get_or_insert_with(BusFeature::new);
        let group = group_name.to_lowercase();
        let mut groups = feature.groups.lock().await;
        if groups.contains(&group) {
            return Ok(());
        }
        self.join_bucket(&self.topics.group(&group), connection)
            .await?;
        groups.insert(group);
        Ok(())
    }

    /// Local half of a group remove. Generates no cross-server traffic.
    async fn remove_group_core(
        &self,
        connection: &Arc<dyn HubConnection>,
        group_name: &str,
    ) -> Result<()> {
        let Some(feature) = connection.features().get::<BusFeature>() else {
            return Ok(());
        };
        let group = group_name.to_lowercase();
        let mut groups = feature.groups.lock().await;
        if !groups.remove(&group) {
            return Ok(());
        }
        self.leave_bucket(&self.topics.group(&group), connection.connection_id())
            .await;
        Ok(())
    }

    /// Add a connection to the bucket for a topic, subscribing the topic on
    /// the 0-to-1 transition. Retries when it races with a concurrent prune.
    async fn join_bucket(&self, topic: &str, connection: &Arc<dyn HubConnection>) -> Result<()> {
        loop {
            let bucket = {
                let entry = self
                    .buckets
                    .entry(topic.to_string())
                    .or_insert_with(|| Arc::new(SubscriptionBucket::new(topic)));
                Arc::clone(entry.value())
            };
            let mut state = bucket.lock().await;
            if state.retired {
                continue;
            }
            let first = state.members.is_empty();
            state
                .members
                .insert(connection.connection_id().to_string(), Arc::clone(connection));
            if first {
                tracing::debug!("subscribing {}", topic);
                if let Err(e) = self.bus.subscribe(topic, self.bucket_handler()).await {
                    state.members.remove(connection.connection_id());
                    state.retired = true;
                    drop(state);
                    self.buckets.remove_if(topic, |_, b| Arc::ptr_eq(b, &bucket));
                    return Err(e);
                }
            }
            return Ok(());
        }
    }

    /// Remove a connection from a topic's bucket, unsubscribing and pruning
    /// the bucket when the last local member leaves.
    async fn leave_bucket(&self, topic: &str, connection_id: &str) {
        let Some(bucket) = self.buckets.get(topic).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let mut state = bucket.lock().await;
        if state.members.remove(connection_id).is_none() {
            return;
        }
        if !state.members.is_empty() || state.retired {
            return;
        }
        state.retired = true;
        tracing::debug!("unsubscribing {}", topic);
        if let Err(e) = self.bus.unsubscribe(topic).await {
            tracing::warn!("unsubscribe of {} failed: {}", topic, e);
        }
        drop(state);
        self.buckets.remove_if(topic, |_, b| Arc::ptr_eq(b, &bucket));
    }

    /// Ask whichever server owns the connection to apply a group mutation,
    /// then wait for its ack or the timeout.
    async fn send_group_command(
        &self,
        action: GroupAction,
        connection_id: &str,
        group_name: &str,
    ) -> Result<()> {
        let pending = self.acks.register();
        let envelope = ControlEnvelope {
            action,
            correlation_id: pending.correlation_id(),
            connection_id: connection_id.to_string(),
            group_name: group_name.to_string(),
            origin_server: self.server_id.clone(),
        };
        self.publish_control(&self.topics.group_control(), &envelope)
            .await?;
        self.acks.wait(pending).await;
        Ok(())
    }
}

#[async_trait]
impl HubLifetimeManager for BusHubLifetimeManager {
    async fn on_connected(&self, connection: Arc<dyn HubConnection>) -> Result<()> {
        let feature = connection.features().get_or_insert_with(BusFeature::new);
        self.connections.add(Arc::clone(&connection));

        let topic = self.topics.connection(connection.connection_id());
        self.bus
            .subscribe(&topic, self.connection_handler(Arc::clone(&connection)))
            .await?;
        feature.subscriptions.lock().insert(topic);

        if let Some(user_id) = connection.user_id().filter(|u| !u.is_empty()) {
            self.join_bucket(&self.topics.user(user_id), &connection)
                .await?;
        }
        Ok(())
    }

    async fn on_disconnected(&self, connection: Arc<dyn HubConnection>) -> Result<()> {
        let connection_id = connection.connection_id().to_string();
        self.connections.remove(&connection_id);

        if let Some(feature) = connection.features().get::<BusFeature>() {
            // Per-connection subscriptions are released even when an
            // individual unsubscribe fails.
            let topics: Vec<String> = feature.subscriptions.lock().drain().collect();
            for topic in topics {
                if let Err(e) = self.bus.unsubscribe(&topic).await {
                    tracing::warn!("unsubscribe of {} failed: {}", topic, e);
                }
            }

            let groups: Vec<String> = feature.groups.lock().await.drain().collect();
            for group in groups {
                self.leave_bucket(&self.topics.group(&group), &connection_id)
                    .await;
            }
        }

        if let Some(user_id) = connection.user_id().filter(|u| !u.is_empty()) {
            self.leave_bucket(&self.topics.user(user_id), &connection_id)
                .await;
        }
        Ok(())
    }

    async fn invoke_all(&self, method: &str, arguments: Vec<HubValue>) -> Result<()> {
        require_argument(method, "method")?;
        let envelope = self.next_envelope(method, arguments, &[]);
        self.publish_invocation(&self.topics.all(), &envelope).await
    }

    async fn invoke_all_except(
        &self,
        method: &str,
        arguments: Vec<HubValue>,
        excluded_ids: &[String],
    ) -> Result<()> {
        require_argument(method, "method")?;
        let envelope = self.next_envelope(method, arguments, excluded_ids);
        self.publish_invocation(&self.topics.all_except(), &envelope)
            .await
    }

    async fn invoke_connection(
        &self,
        connection_id: &str,
        method: &str,
        arguments: Vec<HubValue>,
    ) -> Result<()> {
        require_argument(connection_id, "connection_id")?;
        require_argument(method, "method")?;

        if let Some(connection) = self.connections.lookup(connection_id) {
            // Local short circuit, no bus round trip.
            let message = InvocationMessage::new(self.invocation_ids.next_id(), method, arguments);
            return connection.write(message).await;
        }
        // Unknown here does not mean unknown to the fleet: publish and let
        // the owning server fan in.
        let envelope = self.next_envelope(method, arguments, &[]);
        self.publish_invocation(&self.topics.connection(connection_id), &envelope)
            .await
    }

    async fn invoke_group(
        &self,
        group_name: &str,
        method: &str,
        arguments: Vec<HubValue>,
    ) -> Result<()> {
        require_argument(group_name, "group_name")?;
        require_argument(method, "method")?;
        let envelope = self.next_envelope(method, arguments, &[]);
        self.publish_invocation(&self.topics.group(group_name), &envelope)
            .await
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
        let envelope = self.next_envelope(method, arguments, excluded_ids);
        self.publish_invocation(&self.topics.group(group_name), &envelope)
            .await
    }

    async fn invoke_user(
        &self,
        user_id: &str,
        method: &str,
        arguments: Vec<HubValue>,
    ) -> Result<()> {
        require_argument(user_id, "user_id")?;
        require_argument(method, "method")?;
        let envelope = self.next_envelope(method, arguments, &[]);
        self.publish_invocation(&self.topics.user(user_id), &envelope)
            .await
    }

    async fn add_to_group(&self, connection_id: &str, group_name: &str) -> Result<()> {
        require_argument(connection_id, "connection_id")?;
        require_argument(group_name, "group_name")?;

        if let Some(connection) = self.connections.lookup(connection_id) {
            return self.add_group_core(&connection, group_name).await;
        }
        self.send_group_command(GroupAction::Add, connection_id, group_name)
            .await
    }

    async fn remove_from_group(&self, connection_id: &str, group_name: &str) -> Result<()> {
        require_argument(connection_id, "connection_id")?;
        require_argument(group_name, "group_name")?;

        if let Some(connection) = self.connections.lookup(connection_id) {
            return self.remove_group_core(&connection, group_name).await;
        }
        self.send_group_command(GroupAction::Remove, connection_id, group_name)
            .await
    }
}
