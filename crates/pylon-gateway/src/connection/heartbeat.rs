//! Periodic heartbeat task

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use crate::connection::session::{HeartbeatStatus, SessionContext};
use crate::connection::{CloseInfo, Outbound};
use crate::protocol::{GatewayEnvelope, ZOMBIED_CLOSE_CODE};

/// Drives the heartbeat cadence for one physical connection.
///
/// The monitor idles until a Hello frame publishes the interval, then sends
/// one heartbeat per interval. Heartbeats bypass the outbound rate limiter
/// so a throttled send queue can never starve liveness. If the previous
/// heartbeat was never acknowledged the connection is declared zombied and
/// force-closed so the reconnect path can take over.
pub(crate) struct HeartbeatMonitor {
    outbound: mpsc::Sender<Outbound>,
    interval: watch::Receiver<Option<u64>>,
    shutdown: watch::Sender<bool>,
    status: Arc<HeartbeatStatus>,
    session: Arc<Mutex<SessionContext>>,
    last_close: Arc<Mutex<Option<CloseInfo>>>,
}

impl HeartbeatMonitor {
    pub(crate) fn new(
        outbound: mpsc::Sender<Outbound>,
        interval: watch::Receiver<Option<u64>>,
        shutdown: watch::Sender<bool>,
        status: Arc<HeartbeatStatus>,
        session: Arc<Mutex<SessionContext>>,
        last_close: Arc<Mutex<Option<CloseInfo>>>,
    ) -> Self {
        Self {
            outbound,
            interval,
            shutdown,
            status,
            session,
            last_close,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            // Idle until a Hello publishes the interval. A session resumed
            // with an old interval passes straight through here.
            let interval_ms = tokio::select! {
                value = self.interval.wait_for(Option::is_some) => match value {
                    Ok(guard) => (*guard).unwrap_or_default(),
                    Err(_) => return,
                },
                _ = shutdown.wait_for(|fired| *fired) => return,
            };

            if self.status.awaiting_ack() {
                error!("Previous heartbeat was never acknowledged, closing zombied connection");
                // The close handler reads the code from here, not from the
                // wire: the receive loop stops on shutdown and would never
                // see a close echo, and the session must not be resumed
                *self.last_close.lock() = Some(CloseInfo {
                    code: Some(ZOMBIED_CLOSE_CODE),
                    reason: Some("zombied connection".to_string()),
                });
                let close = Outbound::Close {
                    code: ZOMBIED_CLOSE_CODE,
                    reason: "zombied connection".to_string(),
                };
                let _ = self.outbound.send(close).await;
                self.shutdown.send_replace(true);
                return;
            }

            let sequence = self.session.lock().sequence;
            debug!(sequence = ?sequence, "Sending heartbeat");
            if self
                .outbound
                .send(Outbound::Frame(GatewayEnvelope::heartbeat(sequence)))
                .await
                .is_err()
            {
                return;
            }
            self.status.mark_sent();

            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
                _ = shutdown.wait_for(|fired| *fired) => return,
            }
        }
    }
}
