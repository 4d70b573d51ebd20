//! Logical session state and heartbeat liveness tracking

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Lifecycle states of a gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport open and no connect attempt in flight
    Disconnected,
    /// Opening the WebSocket transport
    Connecting,
    /// Transport open, identify sent, waiting for the ready event
    Identifying,
    /// Transport open, resume sent, waiting for the resumed event
    Resuming,
    /// Session established, events flowing
    Connected,
    /// Tearing down the current transport
    Closing,
    /// Waiting out the backoff before the next connect attempt
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Logical session state that survives physical reconnects.
///
/// `session_id` and `sequence` together form the resume credentials; they
/// are only cleared when the server invalidates the session.
#[derive(Debug)]
pub struct SessionContext {
    pub session_id: Option<String>,
    pub sequence: Option<u64>,
    pub reconnects: u32,
    pub max_reconnects: u32,
}

impl SessionContext {
    pub fn new(max_reconnects: u32) -> Self {
        Self {
            session_id: None,
            sequence: None,
            reconnects: 0,
            max_reconnects,
        }
    }

    /// Records a sequence number from an incoming frame.
    ///
    /// Returns `false` when the incoming number regresses below the stored
    /// one, in which case the stored value is left untouched.
    pub fn observe_sequence(&mut self, incoming: u64) -> bool {
        match self.sequence {
            Some(current) if incoming < current => false,
            _ => {
                self.sequence = Some(incoming);
                true
            }
        }
    }

    /// Resume credentials, if a complete set is held.
    pub fn resume_candidate(&self) -> Option<(String, u64)> {
        match (&self.session_id, self.sequence) {
            (Some(id), Some(seq)) => Some((id.clone(), seq)),
            _ => None,
        }
    }

    /// Drops the resume credentials so the next connection identifies fresh.
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.sequence = None;
    }
}

/// Heartbeat liveness shared between the monitor task and the receive loop.
#[derive(Debug)]
pub struct HeartbeatStatus {
    awaiting_ack: AtomicBool,
    last_sent: Mutex<Option<Instant>>,
    latency: Mutex<Option<Duration>>,
}

impl HeartbeatStatus {
    pub fn new() -> Self {
        Self {
            awaiting_ack: AtomicBool::new(false),
            last_sent: Mutex::new(None),
            latency: Mutex::new(None),
        }
    }

    /// Marks a heartbeat as sent and starts expecting an ack.
    pub fn mark_sent(&self) {
        *self.last_sent.lock() = Some(Instant::now());
        self.awaiting_ack.store(true, Ordering::SeqCst);
    }

    /// Whether a sent heartbeat is still unacknowledged.
    pub fn awaiting_ack(&self) -> bool {
        self.awaiting_ack.load(Ordering::SeqCst)
    }

    /// Records an ack and returns the measured round-trip latency.
    pub fn ack(&self) -> Option<Duration> {
        self.awaiting_ack.store(false, Ordering::SeqCst);
        let elapsed = self.last_sent.lock().map(|sent| sent.elapsed());
        if let Some(latency) = elapsed {
            *self.latency.lock() = Some(latency);
        }
        elapsed
    }

    /// Last measured heartbeat round-trip latency.
    pub fn latency(&self) -> Option<Duration> {
        *self.latency.lock()
    }

    /// Clears per-connection liveness state. Called on every close.
    pub fn reset(&self) {
        self.awaiting_ack.store(false, Ordering::SeqCst);
        *self.last_sent.lock() = None;
    }
}

impl Default for HeartbeatStatus {
    fn default() -> Self {
        Self::new()
    }
}
