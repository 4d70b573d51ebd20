//! # pylon-gateway
//!
//! Client for the real-time gateway: connection lifecycle with
//! identify/resume, heartbeat liveness, frame decompression and decoding,
//! and event dispatch to application callbacks.

pub mod codec;
pub mod connection;
pub mod error;
pub mod events;
pub mod protocol;

pub use connection::{ConnectionState, GatewayConnection};
pub use error::GatewayError;
pub use events::{DispatchError, EventDispatcher};
pub use protocol::{CloseCode, GatewayEnvelope, OpCode};
