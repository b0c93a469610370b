// Multi-server fan-out tests
//
// Stands up several bus-backed managers against one in-process broker and
// exercises fleet-wide delivery, group membership mutations across servers,
// user streams, and the local short circuit.

use async_trait::async_trait;
use bytes::Bytes;
use rusty_hub::bus::{BusHandler, InMemoryBroker, MessageBus};
use rusty_hub::connection::Features;
use rusty_hub::{
    BusHubLifetimeManager, HubConnection, HubError, HubLifetimeManager, HubManagerConfig,
    HubValue, InvocationMessage, Result,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;

type Inbox = mpsc::UnboundedReceiver<InvocationMessage>;

struct TestConnection {
    id: String,
    user: Option<String>,
    features: Features,
    outbound: mpsc::UnboundedSender<InvocationMessage>,
}

impl TestConnection {
    fn new(id: &str) -> (Arc<Self>, Inbox) {
        Self::build(id, None)
    }

    fn with_user(id: &str, user: &str) -> (Arc<Self>, Inbox) {
        Self::build(id, Some(user.to_string()))
    }

    fn build(id: &str, user: Option<String>) -> (Arc<Self>, Inbox) {
        let (outbound, inbox) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: id.to_string(),
            user,
            features: Features::new(),
            outbound,
        });
        (connection, inbox)
    }
}

#[async_trait]
impl HubConnection for TestConnection {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn user_id(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn features(&self) -> &Features {
        &self.features
    }

    async fn write(&self, message: InvocationMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| HubError::Connection("connection closed".to_string()))
    }
}

/// Bus decorator counting every publish that reaches the broker.
struct CountingBus {
    inner: Arc<dyn MessageBus>,
    published: AtomicUsize,
}

impl CountingBus {
    fn new(inner: Arc<dyn MessageBus>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            published: AtomicUsize::new(0),
        })
    }

    fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageBus for CountingBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.inner.publish(topic, payload).await
    }

    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<()> {
        self.inner.subscribe(topic, handler).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.inner.unsubscribe(topic).await
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        self.inner.unsubscribe_all().await
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

async fn server(broker: &Arc<InMemoryBroker>) -> Arc<BusHubLifetimeManager> {
    server_with_timeout(broker, Duration::from_secs(5)).await
}

async fn server_with_timeout(
    broker: &Arc<InMemoryBroker>,
    ack_timeout: Duration,
) -> Arc<BusHubLifetimeManager> {
    init_tracing();
    let bus: Arc<dyn MessageBus> = broker.connect();
    BusHubLifetimeManager::new("chat", bus, HubManagerConfig { ack_timeout })
        .await
        .expect("manager startup")
}

async fn recv(inbox: &mut Inbox) -> InvocationMessage {
    timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("timed out waiting for an invocation")
        .expect("connection closed")
}

async fn assert_silent(inbox: &mut Inbox) {
    assert!(
        timeout(Duration::from_millis(250), inbox.recv())
            .await
            .is_err(),
        "unexpected invocation delivered"
    );
}

#[tokio::test]
async fn broadcast_reaches_every_connection_on_every_server() {
    let broker = InMemoryBroker::new();
    let s1 = server(&broker).await;
    let s2 = server(&broker).await;

    let (a, mut a_inbox) = TestConnection::new("A");
    let (b, mut b_inbox) = TestConnection::new("B");
    let (c, mut c_inbox) = TestConnection::new("C");
    s1.on_connected(a).await.unwrap();
    s1.on_connected(b).await.unwrap();
    s2.on_connected(c).await.unwrap();

    s1.invoke_all("Echo", vec![HubValue::from("hi")])
        .await
        .unwrap();

    for inbox in [&mut a_inbox, &mut b_inbox, &mut c_inbox] {
        let message = recv(inbox).await;
        assert_eq!(message.target, "Echo");
        assert_eq!(message.arguments, vec![HubValue::from("hi")]);
        assert!(message.non_blocking);
    }
}

#[tokio::test]
async fn broadcast_exclusions_filter_by_connection_id() {
    let broker = InMemoryBroker::new();
    let s1 = server(&broker).await;
    let s2 = server(&broker).await;

    let (a, mut a_inbox) = TestConnection::new("A");
    let (b, mut b_inbox) = TestConnection::new("B");
    let (c, mut c_inbox) = TestConnection::new("C");
    s1.on_connected(a).await.unwrap();
    s1.on_connected(b).await.unwrap();
    s2.on_connected(c).await.unwrap();

    s1.invoke_all_except("Echo", vec![HubValue::from("hi")], &["B".to_string()])
        .await
        .unwrap();

    recv(&mut a_inbox).await;
    recv(&mut c_inbox).await;
    assert_silent(&mut b_inbox).await;
}

#[tokio::test]
async fn group_add_for_a_remote_connection_is_applied_and_acknowledged() {
    let broker = InMemoryBroker::new();
    let s1 = server(&broker).await;
    let s2 = server(&broker).await;

    let (a, mut a_inbox) = TestConnection::new("A");
    let (b, mut b_inbox) = TestConnection::new("B");
    s1.on_connected(a).await.unwrap();
    s2.on_connected(b).await.unwrap();

    // B lives on the other server, so this round-trips the control topic.
    let started = Instant::now();
    s1.add_to_group("B", "g").await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "mutation should complete on the ack, not the timeout"
    );

    s1.invoke_group("g", "Ping", vec![]).await.unwrap();

    let message = recv(&mut b_inbox).await;
    assert_eq!(message.target, "Ping");
    assert_silent(&mut a_inbox).await;
}

#[tokio::test]
async fn group_exclusions_can_empty_a_delivery() {
    let broker = InMemoryBroker::new();
    let s1 = server(&broker).await;
    let s2 = server(&broker).await;

    let (a, mut a_inbox) = TestConnection::new("A");
    s1.on_connected(a).await.unwrap();
    s1.add_to_group("A", "g").await.unwrap();

    s2.invoke_group_except("g", "Ping", vec![], &["A".to_string()])
        .await
        .unwrap();

    assert_silent(&mut a_inbox).await;
}

#[tokio::test]
async fn user_invoke_delivers_once_to_each_connection_of_the_user() {
    let broker = InMemoryBroker::new();
    let s1 = server(&broker).await;
    let s2 = server(&broker).await;

    let (a, mut a_inbox) = TestConnection::with_user("A", "u1");
    let (b, mut b_inbox) = TestConnection::with_user("B", "u1");
    s1.on_connected(a).await.unwrap();
    s2.on_connected(b).await.unwrap();

    s1.invoke_user("u1", "Ping", vec![]).await.unwrap();

    recv(&mut a_inbox).await;
    recv(&mut b_inbox).await;
    assert_silent(&mut a_inbox).await;
    assert_silent(&mut b_inbox).await;
}

#[tokio::test]
async fn ghost_group_mutation_completes_within_the_ack_timeout() {
    let broker = InMemoryBroker::new();
    let s1 = server_with_timeout(&broker, Duration::from_millis(300)).await;
    let _s2 = server_with_timeout(&broker, Duration::from_millis(300)).await;

    let started = Instant::now();
    s1.remove_from_group("Z", "g").await.unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn local_single_connection_sends_skip_the_bus() {
    let broker = InMemoryBroker::new();
    init_tracing();
    let counting = CountingBus::new(broker.connect());
    let manager = BusHubLifetimeManager::new(
        "chat",
        counting.clone() as Arc<dyn MessageBus>,
        HubManagerConfig::default(),
    )
    .await
    .unwrap();

    let (a, mut a_inbox) = TestConnection::new("A");
    manager.on_connected(a).await.unwrap();

    manager.invoke_connection("A", "Ping", vec![]).await.unwrap();
    recv(&mut a_inbox).await;
    assert_eq!(counting.published(), 0);

    // An id unknown here is still published for whichever server owns it.
    manager
        .invoke_connection("elsewhere", "Ping", vec![])
        .await
        .unwrap();
    assert_eq!(counting.published(), 1);
}

#[tokio::test]
async fn group_names_are_case_insensitive_across_servers() {
    let broker = InMemoryBroker::new();
    let s1 = server(&broker).await;
    let s2 = server(&broker).await;

    let (a, mut a_inbox) = TestConnection::new("A");
    s1.on_connected(a).await.unwrap();
    s1.add_to_group("A", "Chat").await.unwrap();

    s2.invoke_group("chat", "Ping", vec![]).await.unwrap();

    recv(&mut a_inbox).await;
}

#[tokio::test]
async fn user_ids_are_case_sensitive() {
    let broker = InMemoryBroker::new();
    let s1 = server(&broker).await;
    let s2 = server(&broker).await;

    let (a, mut a_inbox) = TestConnection::with_user("A", "alice");
    s1.on_connected(a).await.unwrap();

    s2.invoke_user("Alice", "Ping", vec![]).await.unwrap();

    assert_silent(&mut a_inbox).await;
}

#[tokio::test]
async fn duplicate_group_add_is_indistinguishable_from_one() {
    let broker = InMemoryBroker::new();
    let s1 = server(&broker).await;

    let (a, mut a_inbox) = TestConnection::new("A");
    s1.on_connected(a).await.unwrap();

    s1.add_to_group("A", "g").await.unwrap();
    s1.add_to_group("A", "g").await.unwrap();
    s1.invoke_group("g", "Ping", vec![]).await.unwrap();

    recv(&mut a_inbox).await;
    assert_silent(&mut a_inbox).await;
}

#[tokio::test]
async fn removing_a_remote_member_stops_delivery() {
    let broker = InMemoryBroker::new();
    let s1 = server(&broker).await;
    let s2 = server(&broker).await;

    let (b, mut b_inbox) = TestConnection::new("B");
    s2.on_connected(b).await.unwrap();

    s1.add_to_group("B", "g").await.unwrap();
    s1.invoke_group("g", "Ping", vec![]).await.unwrap();
    recv(&mut b_inbox).await;

    s1.remove_from_group("B", "g").await.unwrap();
    s1.invoke_group("g", "Ping", vec![]).await.unwrap();
    assert_silent(&mut b_inbox).await;
}

#[tokio::test]
async fn disconnect_releases_every_subscription() {
    let broker = InMemoryBroker::new();
    let s1 = server(&broker).await;
    let s2 = server(&broker).await;

    let (a, mut a_inbox) = TestConnection::with_user("A", "u1");
    s1.on_connected(a.clone()).await.unwrap();
    s1.add_to_group("A", "g").await.unwrap();

    s1.on_disconnected(a).await.unwrap();

    s2.invoke_all("Ping", vec![]).await.unwrap();
    s2.invoke_connection("A", "Ping", vec![]).await.unwrap();
    s2.invoke_group("g", "Ping", vec![]).await.unwrap();
    s2.invoke_user("u1", "Ping", vec![]).await.unwrap();

    assert_silent(&mut a_inbox).await;
}

#[tokio::test]
async fn two_connections_of_one_user_share_the_user_stream() {
    let broker = InMemoryBroker::new();
    let s1 = server(&broker).await;
    let s2 = server(&broker).await;

    let (a, mut a_inbox) = TestConnection::with_user("A", "u1");
    let (b, mut b_inbox) = TestConnection::with_user("B", "u1");
    s1.on_connected(a.clone()).await.unwrap();
    s1.on_connected(b).await.unwrap();

    s1.on_disconnected(a).await.unwrap();
    s2.invoke_user("u1", "Ping", vec![]).await.unwrap();

    recv(&mut b_inbox).await;
    assert_silent(&mut a_inbox).await;
}

#[tokio::test]
async fn empty_required_arguments_fail_before_any_publish() {
    let broker = InMemoryBroker::new();
    init_tracing();
    let counting = CountingBus::new(broker.connect());
    let manager = BusHubLifetimeManager::new(
        "chat",
        counting.clone() as Arc<dyn MessageBus>,
        HubManagerConfig::default(),
    )
    .await
    .unwrap();

    assert!(matches!(
        manager.add_to_group("", "g").await,
        Err(HubError::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.add_to_group("c", "").await,
        Err(HubError::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.invoke_user("", "Ping", vec![]).await,
        Err(HubError::InvalidArgument(_))
    ));
    assert_eq!(counting.published(), 0);
}

#[tokio::test]
async fn shutdown_releases_the_servers_subscriptions() {
    let broker = InMemoryBroker::new();
    let s1 = server(&broker).await;
    let s2 = server(&broker).await;

    let (a, mut a_inbox) = TestConnection::new("A");
    s1.on_connected(a).await.unwrap();

    s1.shutdown().await;
    s2.invoke_all("Ping", vec![]).await.unwrap();

    assert_silent(&mut a_inbox).await;
}
