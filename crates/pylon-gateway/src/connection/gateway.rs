//! The gateway connection state machine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use pylon_common::{ClientConfig, GatewaySettings};
use pylon_http::{BucketKey, HttpClient, RateLimiter, SessionStartLimit};

use crate::codec::FrameCodec;
use crate::connection::heartbeat::HeartbeatMonitor;
use crate::connection::session::{ConnectionState, HeartbeatStatus, SessionContext};
use crate::connection::{CloseInfo, Outbound};
use crate::error::GatewayError;
use crate::events::{parse_event, EventDispatcher};
use crate::protocol::{
    CloseCode, GatewayEnvelope, IdentifyPayload, OpCode, ResumePayload,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Protocol version pinned into the connection URL
const GATEWAY_VERSION: u8 = 6;

/// Base reconnect delay; each attempt adds one more second on top
const BACKOFF_FLOOR: Duration = Duration::from_secs(10);

/// One payload per second, deliberately below the documented allowance so
/// bursts from application code never trip the server-side limit
const GATEWAY_SEND_LIMIT: u32 = 1;
const GATEWAY_SEND_WINDOW: Duration = Duration::from_secs(1);

const OUTBOUND_BUFFER: usize = 64;

/// How long to wait for connection tasks to drain before aborting them
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum NextStep {
    Reconnect,
    Stop,
}

/// A resilient client connection to the real-time gateway.
///
/// One instance owns the logical session across any number of physical
/// WebSocket connections: it identifies or resumes on open, keeps the
/// session alive with heartbeats, decodes and dispatches events, and
/// reconnects with linear backoff until the budget runs out or
/// [`close`](Self::close) is called.
pub struct GatewayConnection {
    token: String,
    settings: GatewaySettings,
    url: String,
    session: Arc<Mutex<SessionContext>>,
    heartbeat: Arc<HeartbeatStatus>,
    dispatcher: Arc<EventDispatcher>,
    limiter: Arc<RateLimiter>,
    state: Mutex<ConnectionState>,
    do_reconnect: AtomicBool,
    interval: watch::Sender<Option<u64>>,
    shutdown: watch::Sender<bool>,
    /// One-shot close signal; unlike `shutdown` it is never reset, so
    /// backoff and admission sleeps can always be interrupted by `close`
    closed: watch::Sender<bool>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    last_close: Arc<Mutex<Option<CloseInfo>>>,
    session_start: Mutex<SessionStartLimit>,
}

impl GatewayConnection {
    /// Builds a connection from an already-known gateway URL.
    ///
    /// The rate limiter is shared with the REST client so a global limit
    /// observed on either side throttles both.
    pub fn new(
        config: &ClientConfig,
        gateway_url: &str,
        session_start: SessionStartLimit,
        limiter: Arc<RateLimiter>,
    ) -> Arc<Self> {
        limiter.declare_fixed_window(BucketKey::Gateway, GATEWAY_SEND_LIMIT, GATEWAY_SEND_WINDOW);

        Arc::new(Self {
            token: config.token.clone(),
            url: Self::format_url(gateway_url, &config.gateway),
            settings: config.gateway.clone(),
            session: Arc::new(Mutex::new(SessionContext::new(config.gateway.max_reconnects))),
            heartbeat: Arc::new(HeartbeatStatus::new()),
            dispatcher: Arc::new(EventDispatcher::new()),
            limiter,
            state: Mutex::new(ConnectionState::Disconnected),
            do_reconnect: AtomicBool::new(true),
            interval: watch::Sender::new(None),
            shutdown: watch::Sender::new(false),
            closed: watch::Sender::new(false),
            outbound: Mutex::new(None),
            last_close: Arc::new(Mutex::new(None)),
            session_start: Mutex::new(session_start),
        })
    }

    /// Fetches the gateway URL and session budget over REST, then builds a
    /// connection sharing that client's rate limiter.
    pub async fn from_http(
        http: &HttpClient,
        config: &ClientConfig,
    ) -> Result<Arc<Self>, GatewayError> {
        let info = http.get_gateway_bot().await?;
        debug!(url = %info.url, shards = info.shards, "Fetched gateway bootstrap info");
        Ok(Self::new(config, &info.url, info.session_start_limit, http.limiter()))
    }

    fn format_url(base: &str, settings: &GatewaySettings) -> String {
        let mut url = format!(
            "{}/?version={GATEWAY_VERSION}&encoding=json",
            base.trim_end_matches('/')
        );
        if settings.zlib_stream {
            url.push_str("&compress=zlib-stream");
        }
        url
    }

    /// The dispatcher application code subscribes on.
    pub fn events(&self) -> Arc<EventDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Last measured heartbeat round-trip latency.
    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.lock().session_id.clone()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.session.lock().sequence
    }

    /// Runs the connection until it is closed or the reconnect budget is
    /// spent. Returns `Ok(())` after a deliberate [`close`](Self::close).
    pub async fn connect(self: &Arc<Self>) -> Result<(), GatewayError> {
        loop {
            self.admission_gate().await;
            // `close` may have fired before or during the admission wait
            if !self.do_reconnect.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }
            self.set_state(ConnectionState::Connecting);
            debug!(url = %self.url, "Opening gateway transport");

            let stream = match connect_async(self.url.as_str()).await {
                Ok((ws, _response)) => ws,
                Err(e) => {
                    warn!(error = %e, "Failed to open gateway transport");
                    match self.on_close(None).await? {
                        NextStep::Reconnect => continue,
                        NextStep::Stop => {
                            self.set_state(ConnectionState::Disconnected);
                            return Ok(());
                        }
                    }
                }
            };

            let (sink, stream) = stream.split();

            // Fresh plumbing for this physical connection
            self.shutdown.send_replace(false);
            *self.last_close.lock() = None;
            let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
            *self.outbound.lock() = Some(out_tx.clone());

            // The handshake frame is queued before anything else can write
            self.on_open(&out_tx).await;

            let mut tasks = JoinSet::new();
            tasks.spawn(Self::write_loop(sink, out_rx));
            {
                let conn = Arc::clone(self);
                tasks.spawn(async move { conn.recv_loop(stream).await });
            }
            let monitor = HeartbeatMonitor::new(
                out_tx,
                self.interval.subscribe(),
                self.shutdown.clone(),
                Arc::clone(&self.heartbeat),
                Arc::clone(&self.session),
                Arc::clone(&self.last_close),
            );
            tasks.spawn(monitor.run());

            // The connection lives until any task requests shutdown
            let mut shutdown = self.shutdown.subscribe();
            let _ = shutdown.wait_for(|fired| *fired).await;
            self.set_state(ConnectionState::Closing);

            // Dropping our sender lets the writer drain and exit
            *self.outbound.lock() = None;
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Connection tasks did not drain in time, aborting them");
                tasks.shutdown().await;
            }

            let close = self.last_close.lock().take();
            match self.on_close(close).await? {
                NextStep::Reconnect => {}
                NextStep::Stop => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
            }
        }
    }

    /// Queues a frame for sending, waiting on the gateway rate limit first.
    pub async fn send(&self, op: OpCode, payload: Option<Value>) -> Result<(), GatewayError> {
        let waited = self.limiter.acquire(&BucketKey::Gateway).await;
        if waited > Duration::ZERO {
            debug!(waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX), "Outbound gateway frame was throttled");
        }
        self.send_raw(GatewayEnvelope::new(op, payload)).await
    }

    /// Closes the connection for good; `connect` returns once teardown is
    /// complete.
    pub async fn close(&self) {
        debug!("Closing the gateway connection");
        self.do_reconnect.store(false, Ordering::SeqCst);
        self.closed.send_replace(true);
        let sender = self.outbound.lock().clone();
        if let Some(sender) = sender {
            let close = Outbound::Close {
                code: 1000,
                reason: "requested by client".to_string(),
            };
            let _ = sender.send(close).await;
        }
        self.shutdown.send_replace(true);
    }

    async fn send_raw(&self, envelope: GatewayEnvelope) -> Result<(), GatewayError> {
        let sender = self.outbound.lock().clone();
        let Some(sender) = sender else {
            return Err(GatewayError::NotConnected);
        };
        debug!(frame = %envelope, "Queueing gateway frame");
        sender
            .send(Outbound::Frame(envelope))
            .await
            .map_err(|_| GatewayError::NotConnected)
    }

    /// Blocks while the session-start budget is exhausted. Returns early if
    /// the connection is closed during the wait.
    async fn admission_gate(&self) {
        let (remaining, reset_after) = {
            let limit = self.session_start.lock();
            (limit.remaining, limit.reset_after)
        };
        if remaining == 0 {
            debug!(wait_ms = reset_after, "Session start limit exhausted, waiting for the window to reset");
            let mut closed = self.closed.subscribe();
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(reset_after)) => {
                    let mut limit = self.session_start.lock();
                    limit.remaining = limit.total;
                }
                _ = closed.wait_for(|closed| *closed) => {}
            }
        }
    }

    /// Sends the handshake frame for a freshly opened transport: resume when
    /// complete credentials are held, identify otherwise. Handshake frames
    /// skip the rate limiter, like heartbeats.
    async fn on_open(&self, sender: &mpsc::Sender<Outbound>) {
        let candidate = self.session.lock().resume_candidate();
        let envelope = match candidate {
            Some((session_id, seq)) => {
                debug!(session_id = %session_id, sequence = seq, "Transport open, resuming session");
                self.set_state(ConnectionState::Resuming);
                GatewayEnvelope::resume(&ResumePayload::new(&self.token, session_id, seq))
            }
            None => {
                debug!("Transport open, identifying");
                self.set_state(ConnectionState::Identifying);
                // Identify consumes a session start; resume does not
                let mut limit = self.session_start.lock();
                limit.remaining = limit.remaining.saturating_sub(1);
                drop(limit);
                GatewayEnvelope::identify(&IdentifyPayload::new(&self.token, &self.settings))
            }
        };
        if sender.send(Outbound::Frame(envelope)).await.is_err() {
            warn!("Writer task gone before the handshake frame was queued");
        }
    }

    async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut outbound: mpsc::Receiver<Outbound>) {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Frame(envelope) => match FrameCodec::encode(&envelope) {
                    Ok(message) => {
                        if let Err(e) = sink.send(message).await {
                            debug!(error = %e, "Transport write failed");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode outbound frame"),
                },
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code: code.into(),
                        reason: reason.into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!(error = %e, "Failed to send close frame");
                    }
                    break;
                }
            }
        }
    }

    async fn recv_loop(self: Arc<Self>, mut stream: SplitStream<WsStream>) {
        let mut codec = FrameCodec::new(self.settings.zlib_stream);
        let mut callback_scope = JoinSet::new();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let message = tokio::select! {
                _ = shutdown.wait_for(|fired| *fired) => break,
                message = stream.next() => message,
            };
            match message {
                Some(Ok(Message::Close(frame))) => {
                    let info = CloseInfo {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame.map(|f| f.reason.into_owned()),
                    };
                    debug!(code = ?info.code, reason = ?info.reason, "Gateway closed the connection");
                    *self.last_close.lock() = Some(info);
                }
                Some(Ok(message)) => match codec.decode(&message) {
                    Ok(Some(envelope)) => self.handle_envelope(envelope, &mut callback_scope).await,
                    Ok(None) => {}
                    // A bad frame never tears down the connection
                    Err(e) => warn!(error = %e, "Dropping undecodable frame"),
                },
                Some(Err(e)) => {
                    debug!(error = %e, "Transport read failed");
                    break;
                }
                None => break,
            }
        }

        callback_scope.shutdown().await;
        self.shutdown.send_replace(true);
    }

    async fn handle_envelope(&self, envelope: GatewayEnvelope, scope: &mut JoinSet<()>) {
        if let Some(incoming) = envelope.s {
            let mut session = self.session.lock();
            if !session.observe_sequence(incoming) {
                warn!(
                    incoming,
                    current = ?session.sequence,
                    "Ignoring sequence number regression"
                );
            }
        }

        match envelope.op {
            OpCode::Dispatch => {
                let Some(name) = envelope.t else {
                    warn!("Dispatch frame without an event name");
                    return;
                };
                self.handle_dispatch(&name, envelope.d.unwrap_or(Value::Null), scope);
            }
            OpCode::Heartbeat => {
                // Requested out of band; the periodic cadence is untouched
                debug!("Heartbeat requested by the gateway");
                let sequence = self.session.lock().sequence;
                if let Err(e) = self.send_raw(GatewayEnvelope::heartbeat(sequence)).await {
                    warn!(error = %e, "Failed to answer a heartbeat request");
                }
            }
            OpCode::Reconnect | OpCode::InvalidSession => {
                debug!(opcode = %envelope.op, "Session invalidated by the gateway, reconnecting fresh");
                self.session.lock().invalidate();
                self.shutdown.send_replace(true);
            }
            OpCode::Hello => match envelope.as_hello() {
                Some(hello) => {
                    debug!(interval_ms = hello.heartbeat_interval, "Received hello, starting heartbeats");
                    self.interval.send_replace(Some(hello.heartbeat_interval));
                }
                None => warn!("Hello frame without a valid payload"),
            },
            OpCode::HeartbeatAck => {
                let latency = self.heartbeat.ack();
                debug!(latency = ?latency, "Heartbeat acknowledged");
            }
            other => warn!(opcode = %other, "Ignoring send-only opcode from the gateway"),
        }
    }

    fn handle_dispatch(&self, name: &str, payload: Value, scope: &mut JoinSet<()>) {
        let (event, payload) = parse_event(name, payload);
        debug!(event = %event, "Dispatching event");

        match event.as_str() {
            "ready" => {
                if let Some(id) = payload.get("session_id").and_then(Value::as_str) {
                    self.session.lock().session_id = Some(id.to_string());
                }
                self.set_state(ConnectionState::Connected);
            }
            "resumed" => self.set_state(ConnectionState::Connected),
            _ => {}
        }

        self.dispatcher.emit_in(scope, &event, &payload);
    }

    async fn on_close(&self, close: Option<CloseInfo>) -> Result<NextStep, GatewayError> {
        match self.close_disposition(close)? {
            Some(delay) => {
                self.set_state(ConnectionState::Reconnecting);
                let mut closed = self.closed.subscribe();
                tokio::select! {
                    () = tokio::time::sleep(delay) => Ok(NextStep::Reconnect),
                    _ = closed.wait_for(|closed| *closed) => Ok(NextStep::Stop),
                }
            }
            None => Ok(NextStep::Stop),
        }
    }

    /// Decides what follows a teardown: `Some(delay)` to reconnect after
    /// backing off, `None` to stop for good.
    fn close_disposition(&self, close: Option<CloseInfo>) -> Result<Option<Duration>, GatewayError> {
        let code = close.as_ref().and_then(|c| c.code);
        debug!(
            code = ?code,
            reason = ?close.as_ref().and_then(|c| c.reason.as_deref()),
            "Connection closed"
        );

        self.heartbeat.reset();
        *self.outbound.lock() = None;

        if !self.do_reconnect.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut session = self.session.lock();
        session.reconnects += 1;
        if session.reconnects > session.max_reconnects {
            return Err(GatewayError::ReconnectsExhausted(session.max_reconnects));
        }

        if code.is_some_and(CloseCode::invalidates_session) {
            session.invalidate();
            // A fresh identify must wait for the next hello
            self.interval.send_replace(None);
        }

        let action = if session.session_id.is_some() { "resume" } else { "identify" };
        let delay = BACKOFF_FLOOR + Duration::from_secs(u64::from(session.reconnects));
        debug!(
            attempt = session.reconnects,
            delay_secs = delay.as_secs(),
            action,
            "Reconnecting after backoff"
        );
        Ok(Some(delay))
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(from = %*state, to = %next, "Connection state changed");
            *state = next;
        }
    }
}
