//! Connection lifecycle: session state, heartbeat liveness and the
//! connection state machine itself.

mod gateway;
mod heartbeat;
mod session;

pub use gateway::GatewayConnection;
pub use session::{ConnectionState, HeartbeatStatus, SessionContext};

use crate::protocol::GatewayEnvelope;

/// Items accepted by a connection's writer task.
///
/// All outbound traffic for one physical connection funnels through a
/// single channel so frames are serialized in queue order.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(GatewayEnvelope),
    Close { code: u16, reason: String },
}

/// Close details captured from the last transport teardown.
///
/// Written by the receive loop for server-initiated closes and by the
/// heartbeat monitor for a zombied connection, read by the close handler
/// to decide whether the session survives.
#[derive(Debug, Clone)]
pub(crate) struct CloseInfo {
    pub(crate) code: Option<u16>,
    pub(crate) reason: Option<String>,
}
