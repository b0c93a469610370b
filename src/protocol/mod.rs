// Wire model for inter-server hub traffic
//
// Defines the invocation and control envelopes exchanged between servers,
// the self-describing argument value type, and the outbound invocation id
// source.

pub mod codec;

pub use codec::WireCodec;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single argument value carried inside an invocation.
///
/// Every value is tagged with a `$type` discriminator on the wire so a
/// receiving server can rehydrate the concrete runtime type without knowing
/// the target method's signature. `Custom` carries application-registered
/// discriminators for user-defined types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type", content = "value")]
pub enum HubValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<HubValue>),
    Object(BTreeMap<String, HubValue>),
    Custom { name: String, data: serde_json::Value },
}

impl From<bool> for HubValue {
    fn from(value: bool) -> Self {
        HubValue::Bool(value)
    }
}

impl From<i64> for HubValue {
    fn from(value: i64) -> Self {
        HubValue::Integer(value)
    }
}

impl From<i32> for HubValue {
    fn from(value: i32) -> Self {
        HubValue::Integer(value as i64)
    }
}

impl From<f64> for HubValue {
    fn from(value: f64) -> Self {
        HubValue::Float(value)
    }
}

impl From<&str> for HubValue {
    fn from(value: &str) -> Self {
        HubValue::String(value.to_string())
    }
}

impl From<String> for HubValue {
    fn from(value: String) -> Self {
        HubValue::String(value)
    }
}

impl From<Vec<HubValue>> for HubValue {
    fn from(value: Vec<HubValue>) -> Self {
        HubValue::Array(value)
    }
}

/// A server-initiated call of a named client method with positional
/// arguments. One instance is created per fan-out operation and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationMessage {
    pub invocation_id: u64,
    pub target: String,
    pub arguments: Vec<HubValue>,
    pub non_blocking: bool,
}

impl InvocationMessage {
    /// Create a non-blocking invocation, the form every fan-out operation
    /// produces.
    pub fn new(invocation_id: u64, target: impl Into<String>, arguments: Vec<HubValue>) -> Self {
        Self {
            invocation_id,
            target: target.into(),
            arguments,
            non_blocking: true,
        }
    }
}

/// Envelope published on invocation topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationEnvelope {
    pub invocation: InvocationMessage,
    /// Connection ids that must not receive this invocation. Exclusion
    /// filters by connection id only; filtering happens on each consuming
    /// server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_ids: Vec<String>,
}

impl InvocationEnvelope {
    pub fn new(invocation: InvocationMessage) -> Self {
        Self {
            invocation,
            excluded_ids: Vec::new(),
        }
    }

    pub fn with_exclusions(invocation: InvocationMessage, excluded_ids: Vec<String>) -> Self {
        Self {
            invocation,
            excluded_ids,
        }
    }

    pub fn is_excluded(&self, connection_id: &str) -> bool {
        self.excluded_ids.iter().any(|id| id == connection_id)
    }
}

/// Action carried by a control envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupAction {
    Add,
    Remove,
    Ack,
}

/// Envelope published on the control topics for cross-server group
/// mutations and their acknowledgements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEnvelope {
    pub action: GroupAction,
    pub correlation_id: u64,
    pub connection_id: String,
    pub group_name: String,
    pub origin_server: String,
}

impl ControlEnvelope {
    /// Acknowledgement addressed to the origin server's private inbox.
    pub fn ack(correlation_id: u64, origin_server: &str) -> Self {
        Self {
            action: GroupAction::Ack,
            correlation_id,
            connection_id: String::new(),
            group_name: String::new(),
            origin_server: origin_server.to_string(),
        }
    }
}

/// Monotonically increasing id source for outbound invocations.
#[derive(Debug, Default)]
pub struct InvocationIdSource {
    next: AtomicU64,
}

impl InvocationIdSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}
