//! Gateway protocol definitions
//!
//! Defines the wire protocol: op codes, the message envelope, handshake
//! payloads, and close codes.

mod close_codes;
mod envelope;
mod opcodes;
mod payloads;

pub use close_codes::{CloseCode, ZOMBIED_CLOSE_CODE};
pub use envelope::GatewayEnvelope;
pub use opcodes::OpCode;
pub use payloads::{HelloPayload, IdentifyPayload, IdentifyProperties, Presence, ResumePayload};
