use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::api::QqApi;
use super::frames::{self, Frame};
use crate::config::GatewayConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Hello frames asking for faster heartbeats than this are clamped.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Used when a Hello frame carries no interval.
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 45_000;
const OUTBOUND_BUFFER: usize = 16;
/// Single-shard session: shard 0 of 1.
const SHARD: [u32; 2] = [0, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Idle,
    ResolvingGateway,
    QuotaWait,
    SocketConnecting,
    AwaitingHello,
    Identifying,
    Heartbeating,
    Ready,
    Backoff,
    CircuitOpen,
    Stopped,
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GatewayState::Idle => "idle",
            GatewayState::ResolvingGateway => "resolving_gateway",
            GatewayState::QuotaWait => "quota_wait",
            GatewayState::SocketConnecting => "socket_connecting",
            GatewayState::AwaitingHello => "awaiting_hello",
            GatewayState::Identifying => "identifying",
            GatewayState::Heartbeating => "heartbeating",
            GatewayState::Ready => "ready",
            GatewayState::Backoff => "backoff",
            GatewayState::CircuitOpen => "circuit_open",
            GatewayState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Observable state of the current gateway session. Written only by the
/// keepalive's own tasks.
#[derive(Debug, Clone)]
pub struct GatewayStatus {
    pub state: GatewayState,
    pub ready: bool,
    /// Incremented for every connection attempt.
    pub generation: u64,
    pub connected_url: Option<String>,
    pub heartbeat_interval: Option<Duration>,
    pub last_sequence: Option<u64>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for GatewayStatus {
    fn default() -> Self {
        Self {
            state: GatewayState::Idle,
            ready: false,
            generation: 0,
            connected_url: None,
            heartbeat_interval: None,
            last_sequence: None,
            last_heartbeat_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway discovery failed: {0:#}")]
    Discovery(anyhow::Error),
    #[error("credential unavailable: {0:#}")]
    Credential(anyhow::Error),
    #[error("websocket error: {0}")]
    Socket(#[from] tungstenite::Error),
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("invalid session: {0}")]
    InvalidSession(String),
    #[error("connection closed: {0}")]
    Closed(String),
}

/// Readiness precondition for channel sends.
#[async_trait]
pub trait SessionGate: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Wait up to `timeout` for the session to become ready.
    async fn wait_until_ready(&self, timeout: Duration) -> bool;

    fn last_error(&self) -> Option<String>;
}

/// Gate used when the gateway session is disabled in the config.
pub struct AlwaysOnline;

#[async_trait]
impl SessionGate for AlwaysOnline {
    fn is_ready(&self) -> bool {
        true
    }

    async fn wait_until_ready(&self, _timeout: Duration) -> bool {
        true
    }

    fn last_error(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Reconnect after this delay.
    Retry(Duration),
    /// Too many consecutive failures: stay down for this long, then call
    /// [`ReconnectPolicy::after_cooldown`].
    CircuitOpen(Duration),
}

/// Exponential backoff with a circuit breaker on top.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    threshold: u32,
    cooldown: Duration,
    backoff: Duration,
    failures: u32,
}

impl ReconnectPolicy {
    pub fn new(config: &GatewayConfig) -> Self {
        let base = Duration::from_secs(config.backoff_base_secs.max(1));
        Self {
            base,
            max: Duration::from_secs(config.backoff_max_secs).max(base),
            threshold: config.circuit_breaker_threshold.max(1),
            cooldown: Duration::from_secs(config.circuit_breaker_sleep_secs),
            backoff: base,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// A non-benign failure: counts toward the breaker and doubles the delay.
    pub fn on_failure(&mut self) -> NextStep {
        self.failures += 1;
        if self.failures >= self.threshold {
            return NextStep::CircuitOpen(self.cooldown);
        }
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.max);
        NextStep::Retry(delay)
    }

    /// The gateway asked us to reconnect; not a failure.
    pub fn on_benign(&self) -> NextStep {
        NextStep::Retry(self.backoff)
    }

    pub fn on_ready(&mut self) {
        self.failures = 0;
        self.backoff = self.base;
    }

    pub fn after_cooldown(&mut self) {
        self.on_ready();
    }
}

enum SessionEnd {
    Stopped,
    ReconnectRequested,
}

#[derive(Debug, PartialEq, Eq)]
enum FrameOutcome {
    Continue,
    Ready,
    Reconnect,
    InvalidSession,
}

struct Shared {
    api: Arc<QqApi>,
    config: GatewayConfig,
    status: Arc<watch::Sender<GatewayStatus>>,
    generation: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: GatewayState) {
        self.status.send_modify(|s| s.state = state);
    }
}

/// Keeps a realtime gateway session online in the background; the platform
/// rejects channel messages from bots that are not connected.
pub struct GatewayKeepAlive {
    shared: Arc<Shared>,
    started: AtomicBool,
}

impl GatewayKeepAlive {
    pub fn new(api: Arc<QqApi>, config: GatewayConfig) -> Self {
        let (status, _) = watch::channel(GatewayStatus::default());
        Self {
            shared: Arc::new(Shared {
                api,
                config,
                status: Arc::new(status),
                generation: Arc::new(AtomicU64::new(0)),
                shutdown: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the connection loop and the status logger. Later calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting gateway keepalive");
        tokio::spawn(connection_loop(Arc::clone(&self.shared)));
        tokio::spawn(status_log_loop(Arc::clone(&self.shared)));
    }

    /// Stop every background task and close the socket. Idempotent.
    pub fn stop(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        info!("Stopping gateway keepalive");
        self.shared.shutdown.cancel();
        self.shared.status.send_modify(|s| {
            s.ready = false;
            s.state = GatewayState::Stopped;
        });
    }

    pub fn status(&self) -> GatewayStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GatewayStatus> {
        self.shared.status.subscribe()
    }
}

#[async_trait]
impl SessionGate for GatewayKeepAlive {
    fn is_ready(&self) -> bool {
        self.shared.status.borrow().ready
    }

    async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let ready = tokio::time::timeout(timeout, rx.wait_for(|s| s.ready)).await;
        matches!(ready, Ok(Ok(_)))
    }

    fn last_error(&self) -> Option<String> {
        self.shared.status.borrow().last_error.clone()
    }
}

/// Returns true when cancelled before the delay elapsed.
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn connection_loop(shared: Arc<Shared>) {
    let mut policy = ReconnectPolicy::new(&shared.config);

    while !shared.shutdown.is_cancelled() {
        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        shared.status.send_modify(|s| {
            s.generation = generation;
            s.ready = false;
            s.last_sequence = None;
            s.heartbeat_interval = None;
        });

        // Child token: cancelled at teardown so this generation's heartbeat
        // and writer tasks stop before anything else happens.
        let connection = shared.shutdown.child_token();
        let result = run_session(&shared, generation, &connection, &mut policy).await;
        connection.cancel();
        shared.status.send_modify(|s| s.ready = false);

        let step = match result {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::ReconnectRequested) => {
                info!("Gateway requested reconnect (generation {})", generation);
                policy.on_benign()
            }
            Err(e) => {
                let step = policy.on_failure();
                warn!(
                    "Gateway session failed (generation {}, consecutive failures {}): {}",
                    generation,
                    policy.failures(),
                    e
                );
                shared.status.send_modify(|s| {
                    s.last_error = Some(e.to_string());
                    s.consecutive_failures = policy.failures();
                });
                step
            }
        };

        match step {
            NextStep::Retry(delay) => {
                shared.set_state(GatewayState::Backoff);
                debug!("Reconnecting to gateway in {:?}", delay);
                if sleep_or_cancel(&shared.shutdown, delay).await {
                    break;
                }
            }
            NextStep::CircuitOpen(cooldown) => {
                shared.set_state(GatewayState::CircuitOpen);
                error!(
                    "Gateway circuit open after {} consecutive failures, pausing for {:?}",
                    policy.failures(),
                    cooldown
                );
                if sleep_or_cancel(&shared.shutdown, cooldown).await {
                    break;
                }
                policy.after_cooldown();
                shared.status.send_modify(|s| s.consecutive_failures = 0);
            }
        }
    }

    shared.status.send_modify(|s| {
        s.ready = false;
        s.state = GatewayState::Stopped;
    });
    info!("Gateway keepalive stopped");
}

async fn run_session(
    shared: &Arc<Shared>,
    generation: u64,
    connection: &CancellationToken,
    policy: &mut ReconnectPolicy,
) -> Result<SessionEnd, GatewayError> {
    let config = &shared.config;

    shared.set_state(GatewayState::ResolvingGateway);
    let gateway = shared
        .api
        .gateway_bot()
        .await
        .map_err(GatewayError::Discovery)?;

    if let Some(limit) = &gateway.session_start_limit {
        if limit.remaining <= 0 {
            let wait = Duration::from_millis(limit.reset_after)
                + Duration::from_secs(config.quota_safety_margin_secs);
            warn!(
                "Gateway session quota exhausted (total {}), waiting {:?} before connecting",
                limit.total, wait
            );
            shared.set_state(GatewayState::QuotaWait);
            if sleep_or_cancel(connection, wait).await {
                return Ok(SessionEnd::Stopped);
            }
        } else if limit.remaining <= config.quota_warn_remaining {
            warn!(
                "Gateway session quota low: {} of {} remaining, resets in {}ms",
                limit.remaining, limit.total, limit.reset_after
            );
        }
    }

    shared.status.send_modify(|s| {
        s.state = GatewayState::SocketConnecting;
        s.connected_url = Some(gateway.url.clone());
    });
    info!("Connecting to gateway {} (generation {})", gateway.url, generation);

    let (socket, _response) = tokio::time::timeout(
        Duration::from_secs(config.connect_timeout_secs),
        tokio_tungstenite::connect_async(gateway.url.as_str()),
    )
    .await
    .map_err(|_| GatewayError::Timeout("connecting to the gateway"))??;

    let (sink, mut stream) = socket.split();
    let (outbound, outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    tokio::spawn(write_loop(sink, outbound_rx, connection.clone()));

    let read_timeout = Duration::from_secs(config.read_timeout_secs);

    shared.set_state(GatewayState::AwaitingHello);
    let Some(hello) = next_frame(&mut stream, connection, read_timeout).await? else {
        return Ok(SessionEnd::Stopped);
    };
    if hello.op != frames::OP_HELLO {
        return Err(GatewayError::Protocol(format!(
            "expected hello (op {}) as first frame, got op {}",
            frames::OP_HELLO,
            hello.op
        )));
    }
    let interval = Duration::from_millis(
        hello
            .heartbeat_interval_ms()
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
    )
    .max(MIN_HEARTBEAT_INTERVAL);
    shared.status.send_modify(|s| s.heartbeat_interval = Some(interval));
    let read_timeout = session_read_timeout(read_timeout, interval);

    shared.set_state(GatewayState::Identifying);
    let authorization = shared
        .api
        .tokens()
        .auth_header(false)
        .await
        .map_err(GatewayError::Credential)?;
    outbound
        .send(frames::identify(&authorization, config.intents, SHARD))
        .await
        .map_err(|_| GatewayError::Closed("writer stopped before identify".to_string()))?;

    tokio::spawn(heartbeat_loop(Heartbeat {
        generation,
        current: Arc::clone(&shared.generation),
        interval,
        status: Arc::clone(&shared.status),
        outbound: outbound.clone(),
        cancel: connection.clone(),
    }));

    shared.set_state(GatewayState::Heartbeating);
    loop {
        let Some(frame) = next_frame(&mut stream, connection, read_timeout).await? else {
            return Ok(SessionEnd::Stopped);
        };
        match apply_frame(&shared.status, &frame) {
            FrameOutcome::Continue => {}
            FrameOutcome::Ready => {
                policy.on_ready();
                info!(
                    "Gateway session ready (generation {}, heartbeat every {:?})",
                    generation, interval
                );
            }
            FrameOutcome::Reconnect => return Ok(SessionEnd::ReconnectRequested),
            FrameOutcome::InvalidSession => {
                return Err(GatewayError::InvalidSession(frame.d.to_string()))
            }
        }
    }
}

/// Read deadline once heartbeating: never shorter than two heartbeat periods,
/// so a slow interval does not starve the socket between acks.
fn session_read_timeout(configured: Duration, interval: Duration) -> Duration {
    configured.max(interval * 2)
}

/// Track the sequence number and interpret a frame received after Hello.
fn apply_frame(status: &watch::Sender<GatewayStatus>, frame: &Frame) -> FrameOutcome {
    if let Some(seq) = frame.s {
        status.send_modify(|s| s.last_sequence = Some(seq));
    }
    match frame.op {
        frames::OP_DISPATCH if frame.is_ready_dispatch() => {
            status.send_modify(|s| {
                s.ready = true;
                s.state = GatewayState::Ready;
                s.consecutive_failures = 0;
                s.last_error = None;
            });
            FrameOutcome::Ready
        }
        frames::OP_RECONNECT => FrameOutcome::Reconnect,
        frames::OP_INVALID_SESSION => FrameOutcome::InvalidSession,
        frames::OP_HEARTBEAT_ACK => {
            debug!("Heartbeat acknowledged");
            FrameOutcome::Continue
        }
        _ => FrameOutcome::Continue,
    }
}

/// Next JSON frame, skipping control messages. `Ok(None)` means cancelled.
async fn next_frame(
    stream: &mut SplitStream<WsStream>,
    cancel: &CancellationToken,
    read_timeout: Duration,
) -> Result<Option<Frame>, GatewayError> {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            next = tokio::time::timeout(read_timeout, stream.next()) => next,
        };
        let message = match next {
            Err(_) => return Err(GatewayError::Timeout("waiting for a gateway frame")),
            Ok(None) => return Err(GatewayError::Closed("stream ended".to_string())),
            Ok(Some(message)) => message?,
        };
        let parsed = match message {
            Message::Text(text) => serde_json::from_str::<Frame>(text.as_str()),
            Message::Binary(bytes) => serde_json::from_slice::<Frame>(&bytes),
            Message::Close(close) => {
                let reason = close
                    .map(|c| format!("code {} {}", u16::from(c.code), c.reason.as_str()))
                    .unwrap_or_else(|| "no close frame".to_string());
                return Err(GatewayError::Closed(reason));
            }
            _ => continue,
        };
        return parsed
            .map(Some)
            .map_err(|e| GatewayError::Protocol(format!("undecodable frame: {}", e)));
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!("Gateway write failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
}

struct Heartbeat {
    generation: u64,
    current: Arc<AtomicU64>,
    interval: Duration,
    status: Arc<watch::Sender<GatewayStatus>>,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// Send a heartbeat carrying the last sequence every `interval`, first one
/// after a full interval. Exits as soon as its generation is superseded.
async fn heartbeat_loop(hb: Heartbeat) {
    let mut ticker = tokio::time::interval_at(Instant::now() + hb.interval, hb.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = hb.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if hb.current.load(Ordering::SeqCst) != hb.generation {
            debug!("Heartbeat for stale generation {} exiting", hb.generation);
            break;
        }
        let seq = hb.status.borrow().last_sequence;
        if hb.outbound.send(frames::heartbeat(seq)).await.is_err() {
            break;
        }
        hb.status.send_modify(|s| s.last_heartbeat_at = Some(Utc::now()));
    }
}

async fn status_log_loop(shared: Arc<Shared>) {
    let period = Duration::from_secs(shared.config.log_interval_secs.max(5));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let status = shared.status.borrow().clone();
        if status.ready {
            let age = status
                .last_heartbeat_at
                .map(|t| (Utc::now() - t).num_seconds().to_string())
                .unwrap_or_else(|| "-".to_string());
            info!(
                "Gateway ready url={} seq={:?} heartbeat_interval={:?} last_heartbeat_age={}s",
                status.connected_url.as_deref().unwrap_or("-"),
                status.last_sequence,
                status.heartbeat_interval.unwrap_or_default(),
                age
            );
        } else {
            warn!(
                "Gateway not ready state={} failures={} last_error={}",
                status.state,
                status.consecutive_failures,
                status.last_error.as_deref().unwrap_or("(none)")
            );
        }
    }
}
