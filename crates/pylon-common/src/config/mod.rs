//! Client configuration
//!
//! Loads configuration from environment variables.

mod client_config;

pub use client_config::{ClientConfig, ConfigError, GatewaySettings, HttpSettings};
