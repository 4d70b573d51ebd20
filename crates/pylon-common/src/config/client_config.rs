//! Client configuration structs
//!
//! Loads configuration from environment variables, with `.env` file support.

use serde::Deserialize;
use std::env;

/// Main client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Bot token used for both the gateway handshake and REST authorization
    pub token: String,
    pub gateway: GatewaySettings,
    pub http: HttpSettings,
}

/// Gateway connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    /// How many reconnect attempts are allowed within one logical run
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,

    /// Whether to request zlib-stream transport compression
    #[serde(default = "default_zlib_stream")]
    pub zlib_stream: bool,

    /// Shard id of this connection
    #[serde(default)]
    pub shard_id: u32,

    /// Total shard count reported in the identify handshake
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// Member count threshold above which guilds send offline members lazily
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_reconnects: default_max_reconnects(),
            zlib_stream: default_zlib_stream(),
            shard_id: 0,
            shard_count: default_shard_count(),
            large_threshold: default_large_threshold(),
        }
    }
}

/// REST client settings
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

// Default value functions
fn default_max_reconnects() -> u32 {
    5
}

fn default_zlib_stream() -> bool {
    true
}

fn default_shard_count() -> u32 {
    1
}

fn default_large_threshold() -> u32 {
    50
}

fn default_base_url() -> String {
    "https://discordapp.com/api/v7".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl ClientConfig {
    /// Create a configuration from a token, with defaults for everything else
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            gateway: GatewaySettings::default(),
            http: HttpSettings::default(),
        }
    }

    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Returns an error if required environment variables are missing
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            token: env::var("PYLON_TOKEN").map_err(|_| ConfigError::MissingVar("PYLON_TOKEN"))?,
            gateway: GatewaySettings {
                max_reconnects: env::var("PYLON_MAX_RECONNECTS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_max_reconnects),
                zlib_stream: env::var("PYLON_ZLIB_STREAM")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_zlib_stream),
                shard_id: env::var("PYLON_SHARD_ID")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                shard_count: env::var("PYLON_SHARD_COUNT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_shard_count),
                large_threshold: env::var("PYLON_LARGE_THRESHOLD")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_large_threshold),
            },
            http: HttpSettings {
                base_url: env::var("PYLON_API_BASE_URL").unwrap_or_else(|_| default_base_url()),
                timeout_secs: env::var("PYLON_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_timeout_secs),
            },
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}
