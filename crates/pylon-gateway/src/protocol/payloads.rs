//! Handshake payload definitions
//!
//! Payload bodies for the Hello, Identify and Resume envelopes.

use pylon_common::GatewaySettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of op 10 (Hello)
///
/// First frame the server sends on a fresh transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,

    /// Debug trace of gateway servers handling the connection
    #[serde(default, rename = "_trace", skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<String>>,
}

/// Body of op 2 (Identify)
///
/// Starts a fresh session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    /// Authentication token
    pub token: String,

    pub properties: IdentifyProperties,

    /// Whether the server may compress individual Dispatch payloads
    pub compress: bool,

    /// Member count above which guilds deliver offline members lazily
    pub large_threshold: u32,

    /// `[shard_id, shard_count]`
    pub shard: [u32; 2],

    pub presence: Presence,
}

impl IdentifyPayload {
    /// Build an identify body from configuration.
    #[must_use]
    pub fn new(token: impl Into<String>, settings: &GatewaySettings) -> Self {
        Self {
            token: token.into(),
            properties: IdentifyProperties::default(),
            compress: true,
            large_threshold: settings.large_threshold,
            shard: [settings.shard_id, settings.shard_count],
            presence: Presence::default(),
        }
    }
}

/// Client connection properties reported at identify time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyProperties {
    #[serde(rename = "$os")]
    pub os: String,

    #[serde(rename = "$browser")]
    pub browser: String,

    #[serde(rename = "$device")]
    pub device: String,

    #[serde(rename = "$referrer")]
    pub referrer: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "pylon".to_string(),
            device: "pylon".to_string(),
            referrer: String::new(),
        }
    }
}

/// Initial presence reported at identify time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub since: Option<u64>,
    pub game: Option<Value>,
    pub status: String,
    pub afk: bool,
}

impl Default for Presence {
    fn default() -> Self {
        Self {
            since: None,
            game: None,
            status: "online".to_string(),
            afk: false,
        }
    }
}

/// Body of op 6 (Resume)
///
/// Continues an existing session after a transport drop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

impl ResumePayload {
    #[must_use]
    pub fn new(token: impl Into<String>, session_id: impl Into<String>, seq: u64) -> Self {
        Self {
            token: token.into(),
            session_id: session_id.into(),
            seq,
        }
    }
}
