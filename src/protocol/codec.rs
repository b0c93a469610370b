// Inter-server envelope codec
//
// Serializes the two envelope shapes that cross the bus to self-describing
// JSON, so the `$type` tags on invocation arguments survive structurally and
// any peer can decode without a shared schema. This codec is independent
// from whatever serializer client-facing transports use.

use crate::error::{HubError, Result};
use crate::protocol::{ControlEnvelope, InvocationEnvelope};
use bytes::Bytes;

/// Codec for the inter-server invocation and control envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl WireCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn encode_invocation(&self, envelope: &InvocationEnvelope) -> Result<Bytes> {
        let raw = serde_json::to_vec(envelope)
            .map_err(|e| HubError::Serialization(format!("invocation encode failed: {}", e)))?;
        Ok(Bytes::from(raw))
    }

    pub fn decode_invocation(&self, payload: &[u8]) -> Result<InvocationEnvelope> {
        serde_json::from_slice(payload)
            .map_err(|e| HubError::Serialization(format!("invocation decode failed: {}", e)))
    }

    pub fn encode_control(&self, envelope: &ControlEnvelope) -> Result<Bytes> {
        let raw = serde_json::to_vec(envelope)
            .map_err(|e| HubError::Serialization(format!("control encode failed: {}", e)))?;
        Ok(Bytes::from(raw))
    }

    pub fn decode_control(&self, payload: &[u8]) -> Result<ControlEnvelope> {
        serde_json::from_slice(payload)
            .map_err(|e| HubError::Serialization(format!("control decode failed: {}", e)))
    }
}
