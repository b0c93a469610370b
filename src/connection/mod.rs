// Connection abstraction and process-local connection state

pub mod features;
pub mod registry;

pub use features::{BusFeature, Features};
pub use registry::ConnectionRegistry;

use crate::error::Result;
use crate::protocol::InvocationMessage;
use async_trait::async_trait;

/// A live client session bound to exactly one server.
///
/// Implemented by the transport layer. The hub core only needs the stable
/// fleet-wide id, the authenticated user when there is one, the
/// per-connection feature bag, and an outbound write sink. The sink is
/// assumed to serialize concurrent writes itself.
#[async_trait]
pub trait HubConnection: Send + Sync {
    /// Stable identifier, unique across the fleet.
    fn connection_id(&self) -> &str;

    /// Authenticated user id, if any.
    fn user_id(&self) -> Option<&str>;

    /// Per-connection feature bag.
    fn features(&self) -> &Features;

    /// Queue a typed message on the connection's outbound channel.
    async fn write(&self, message: InvocationMessage) -> Result<()>;
}
