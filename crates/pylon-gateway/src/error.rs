//! Gateway error types

use thiserror::Error;

/// Errors that cross the gateway component boundary.
///
/// Everything recoverable within one connection attempt (decode errors, a
/// missed heartbeat, transient transport drops) is absorbed internally;
/// only these surface to the caller.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No physical connection is open to carry the frame
    #[error("Gateway connection is not open")]
    NotConnected,

    /// The reconnect budget is spent; the caller decides whether to restart
    #[error("Exceeded the allowed amount of reconnects ({0})")]
    ReconnectsExhausted(u32),

    /// Fetching the gateway bootstrap payload failed
    #[error("Gateway bootstrap request failed: {0}")]
    Bootstrap(#[from] pylon_http::HttpError),
}
