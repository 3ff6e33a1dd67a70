//! The gateway link

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use super::backoff::Backoff;
use super::handshake::{hello_protocol, ClientInfo, ConnectParams};
use super::{FrameHandler, FrameSink, LinkState};
use crate::error::{BridgeError, Result};
use crate::protocol::{GatewayEvent, InboundFrame, OutboundRequest, ResponseFrame};

/// Gateway link settings
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// WebSocket URL of the gateway
    pub url: String,
    /// Token presented in the connect handshake
    pub token: Option<String>,
    /// Identity presented in the connect handshake
    pub client: ClientInfo,
    /// Limit for opening the transport and for completing the handshake
    pub connect_timeout: Duration,
    /// First reconnect delay
    pub reconnect_base: Duration,
    /// Reconnect delay cap
    pub reconnect_max: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: None,
            client: ClientInfo::default(),
            connect_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(3),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

/// Link counters
#[derive(Debug, Clone, Serialize)]
pub struct LinkMetrics {
    /// Current state
    pub state: LinkState,
    /// Transport open attempts
    pub connect_attempts: u64,
    /// Reconnect timers armed
    pub reconnects_scheduled: u64,
    /// Text frames received
    pub frames_received: u64,
    /// Frames dropped as malformed or unhandled
    pub frames_dropped: u64,
    /// Seconds since the last successful handshake, while connected
    pub connected_for_secs: Option<u64>,
    /// Whether a reconnect timer is armed
    pub reconnect_pending: bool,
}

struct LinkInner {
    config: LinkConfig,
    state: watch::Sender<LinkState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    handler: RwLock<Option<Arc<dyn FrameHandler>>>,
    backoff: Mutex<Backoff>,
    reconnect_pending: AtomicBool,
    shutdown: watch::Sender<bool>,
    generation: AtomicU64,
    connect_request_id: Mutex<Option<String>>,
    next_handshake_id: AtomicU64,
    connected_since: Mutex<Option<Instant>>,
    connect_attempts: AtomicU64,
    reconnects_scheduled: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

/// The single upstream connection to the gateway
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct GatewayLink {
    inner: Arc<LinkInner>,
}

impl GatewayLink {
    /// Create a link in the `Disconnected` state
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        let backoff = Backoff::new(config.reconnect_base, config.reconnect_max);
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(LinkInner {
                config,
                state,
                outbound: Mutex::new(None),
                handler: RwLock::new(None),
                backoff: Mutex::new(backoff),
                reconnect_pending: AtomicBool::new(false),
                shutdown,
                generation: AtomicU64::new(0),
                connect_request_id: Mutex::new(None),
                next_handshake_id: AtomicU64::new(1),
                connected_since: Mutex::new(None),
                connect_attempts: AtomicU64::new(0),
                reconnects_scheduled: AtomicU64::new(0),
                frames_received: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Start connecting
    ///
    /// No-op while connecting, awaiting the challenge, connected, or after
    /// shutdown.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Send a request frame
    pub fn send(&self, frame: &OutboundRequest) -> Result<()> {
        let state = self.state();
        if state != LinkState::Connected {
            return Err(BridgeError::Connection(format!("gateway link is {state}")));
        }
        let text = frame.to_json()?;
        self.inner.send_raw(Message::Text(text))
    }

    /// Register the handler for inbound frames, replacing any earlier one
    pub fn on_frame(&self, handler: Arc<dyn FrameHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Whether the handshake has completed
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    /// Close the transport and never reconnect again
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.send_replace(true);
        inner.outbound.lock().take();
        inner.connected_since.lock().take();
        inner.state.send_replace(LinkState::Disconnected);
        tracing::info!("Gateway link shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Counters for stats
    #[must_use]
    pub fn metrics(&self) -> LinkMetrics {
        let inner = &self.inner;
        LinkMetrics {
            state: self.state(),
            connect_attempts: inner.connect_attempts.load(Ordering::Relaxed),
            reconnects_scheduled: inner.reconnects_scheduled.load(Ordering::Relaxed),
            frames_received: inner.frames_received.load(Ordering::Relaxed),
            frames_dropped: inner.frames_dropped.load(Ordering::Relaxed),
            connected_for_secs: inner
                .connected_since
                .lock()
                .map(|since| since.elapsed().as_secs()),
            reconnect_pending: inner.reconnect_pending.load(Ordering::SeqCst),
        }
    }
}

impl FrameSink for GatewayLink {
    fn send_frame(&self, frame: &OutboundRequest) -> Result<()> {
        self.send(frame)
    }

    fn is_connected(&self) -> bool {
        GatewayLink::is_connected(self)
    }
}

impl std::fmt::Debug for GatewayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayLink")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl LinkInner {
    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn connect(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }
        let claimed = self.state.send_if_modified(|state| {
            if state.is_active() {
                false
            } else {
                *state = LinkState::Connecting;
                true
            }
        });
        if !claimed {
            tracing::debug!(state = %self.state(), "Connect ignored, link already active");
            return;
        }

        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_connection(generation).await });
    }

    async fn run_connection(self: Arc<Self>, generation: u64) {
        let url = self.config.url.clone();
        tracing::info!(url = %url, "Connecting to gateway");

        let opened =
            tokio::time::timeout(self.config.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await;
        let ws = match opened {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                tracing::warn!(url = %url, error = %e, "Gateway connection failed");
                self.transport_closed(generation);
                return;
            }
            Err(_) => {
                tracing::warn!(url = %url, timeout = ?self.config.connect_timeout, "Gateway connection timed out");
                self.transport_closed(generation);
                return;
            }
        };

        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow() {
            return;
        }

        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        self.state.send_replace(LinkState::AwaitingChallenge);
        tracing::debug!(url = %url, "Gateway transport open, awaiting challenge");

        let handshake_deadline = Instant::now() + self.config.connect_timeout;

        loop {
            let handshaking = self.state() != LinkState::Connected;
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(message) = outgoing else {
                        tracing::debug!("Outbound channel closed");
                        break;
                    };
                    if let Err(e) = write.send(message).await {
                        tracing::warn!(error = %e, "Gateway write failed");
                        break;
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Gateway closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Gateway read failed");
                        break;
                    }
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                () = tokio::time::sleep_until(handshake_deadline), if handshaking => {
                    tracing::warn!(state = %self.state(), "Gateway handshake timed out");
                    break;
                }
            }
        }

        self.transport_closed(generation);
    }

    fn send_raw(&self, message: Message) -> Result<()> {
        let outbound = self.outbound.lock();
        let tx = outbound
            .as_ref()
            .ok_or_else(|| BridgeError::Connection("gateway transport closed".to_string()))?;
        tx.send(message)
            .map_err(|_| BridgeError::Connection("gateway transport closed".to_string()))
    }

    fn handle_text(&self, text: &str) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);

        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Dropping malformed gateway frame");
                return;
            }
        };

        match frame {
            InboundFrame::Event(GatewayEvent::ConnectChallenge { nonce }) => {
                self.answer_challenge(&nonce);
            }
            InboundFrame::Response(response) if self.is_handshake_response(&response.id) => {
                self.complete_handshake(response);
            }
            frame => {
                let handler = self.handler.read().clone();
                match handler {
                    Some(handler) => handler.handle_frame(frame),
                    None => {
                        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("No frame handler registered, frame dropped");
                    }
                }
            }
        }
    }

    fn is_handshake_response(&self, id: &str) -> bool {
        self.connect_request_id.lock().as_deref() == Some(id)
    }

    fn answer_challenge(&self, nonce: &str) {
        if self.state() != LinkState::AwaitingChallenge {
            tracing::debug!(state = %self.state(), "Unexpected connect challenge ignored");
            return;
        }

        let id = format!(
            "connect-{}",
            self.next_handshake_id.fetch_add(1, Ordering::SeqCst)
        );
        let params = ConnectParams::new(
            self.config.client.clone(),
            self.config.token.as_deref(),
            nonce,
        );
        let frame = OutboundRequest::new(id.clone(), "connect", params.to_value());
        *self.connect_request_id.lock() = Some(id);

        let sent = frame
            .to_json()
            .and_then(|text| self.send_raw(Message::Text(text)));
        if let Err(e) = sent {
            tracing::warn!(error = %e, "Failed to send connect request");
        }
    }

    fn complete_handshake(&self, response: ResponseFrame) {
        self.connect_request_id.lock().take();
        match response.outcome {
            Ok(payload) => {
                *self.connected_since.lock() = Some(Instant::now());
                self.backoff.lock().reset();
                self.state.send_replace(LinkState::Connected);
                tracing::info!(
                    protocol = ?hello_protocol(&payload),
                    "Gateway handshake complete"
                );
            }
            Err(err) => {
                tracing::warn!(
                    code = %err.code,
                    message = %err.message,
                    "Gateway rejected handshake"
                );
                // Closing the outbound channel ends the connection task
                self.outbound.lock().take();
            }
        }
    }

    fn transport_closed(self: &Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.outbound.lock().take();
        self.connect_request_id.lock().take();
        self.connected_since.lock().take();
        self.state.send_replace(LinkState::Disconnected);

        if self.is_shut_down() {
            return;
        }
        tracing::info!("Gateway transport closed");
        self.schedule_reconnect();
    }

    /// Arm the reconnect timer unless one is already pending
    fn schedule_reconnect(self: &Arc<Self>) -> bool {
        if self.is_shut_down() {
            return false;
        }
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            tracing::debug!("Reconnect already pending");
            return false;
        }

        let (delay, attempt) = {
            let mut backoff = self.backoff.lock();
            (backoff.next_delay(), backoff.attempt())
        };
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
        tracing::info!(?delay, attempt, "Scheduling gateway reconnect");

        let deadline = Instant::now() + delay;
        let inner = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                _ = shutdown_rx.changed() => {}
            }
            inner.reconnect_pending.store(false, Ordering::SeqCst);
            inner.connect();
        });
        true
    }
}
