//! Gateway message envelope
//!
//! Every payload crossing the WebSocket is wrapped in this envelope.

use super::{HelloPayload, IdentifyPayload, OpCode, ResumePayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The gateway wire envelope: `{op, d, s, t}`.
///
/// `s` and `t` are only populated on Dispatch (op 0) frames from the
/// server; outbound frames carry `op` and `d` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEnvelope {
    /// Operation code
    pub op: OpCode,

    /// Payload body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,

    /// Sequence number (Dispatch frames only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,

    /// Event name (Dispatch frames only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayEnvelope {
    /// Create an outbound envelope for an arbitrary opcode.
    #[must_use]
    pub fn new(op: OpCode, payload: Option<Value>) -> Self {
        Self {
            op,
            d: payload,
            s: None,
            t: None,
        }
    }

    /// Create a Heartbeat frame (op=1) carrying the last observed sequence.
    ///
    /// A null `d` is deliberate before the first Dispatch is seen, so the
    /// body is always present.
    #[must_use]
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::new(OpCode::Heartbeat, Some(sequence.map_or(Value::Null, Value::from)))
    }

    /// Create an Identify frame (op=2).
    #[must_use]
    pub fn identify(payload: &IdentifyPayload) -> Self {
        Self::new(
            OpCode::Identify,
            Some(serde_json::to_value(payload).unwrap_or_default()),
        )
    }

    /// Create a Resume frame (op=6).
    #[must_use]
    pub fn resume(payload: &ResumePayload) -> Self {
        Self::new(
            OpCode::Resume,
            Some(serde_json::to_value(payload).unwrap_or_default()),
        )
    }

    /// Try to parse the body as a Hello payload (op=10).
    #[must_use]
    pub fn as_hello(&self) -> Option<HelloPayload> {
        if self.op != OpCode::Hello {
            return None;
        }
        self.d
            .as_ref()
            .and_then(|d| serde_json::from_value(d.clone()).ok())
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl std::fmt::Display for GatewayEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(t) = &self.t {
            write!(f, "GatewayEnvelope(op={}, t={}", self.op, t)?;
            if let Some(s) = self.s {
                write!(f, ", s={s}")?;
            }
            write!(f, ")")
        } else {
            write!(f, "GatewayEnvelope(op={})", self.op)
        }
    }
}
