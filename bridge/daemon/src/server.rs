//! Daemon Server Implementation
//!
//! This module provides the client-facing server loop for the bridge daemon:
//! - Accepts WebSocket connections on a TCP listener
//! - Spawns a handler task per connection
//! - Binds each connection to a logical session in the bridge
//! - Periodically cleans up sessions whose transport went away
//! - Supports graceful shutdown
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!      Phone tab       Laptop tab      Kitchen tablet
//!      (conn-1)        (conn-2)        (conn-3)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                       Bridge
//!              (with SessionRegistry)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn, Instrument};

use bridge_core::config::ServerConfig;
use bridge_core::{Bridge, BridgeError, BridgeMessage, ClientMessage, ConnectionId, SessionHandle, SessionId};

/// Connection state tracking (internal to server, separate from SessionHandle)
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Peer IP, also the rate-limit source key
    peer: String,
    /// Session bound by `register`, if any
    session: Option<SessionId>,
    /// Handle to abort the connection task, set once it is spawned
    abort_handle: Option<tokio::task::AbortHandle>,
}

/// The client-facing server
pub struct DaemonServer {
    bridge: Arc<Bridge>,
    config: ServerConfig,
    /// Active connection state (task handles, peer info)
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    /// Create a server feeding `bridge`
    pub fn new(bridge: Arc<Bridge>, config: ServerConfig) -> Self {
        Self {
            bridge,
            config,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Bind the listen address and accept connections until `shutdown`
    /// flips to true
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.listen_addr))?;
        info!(addr = %self.config.listen_addr, "Listening for client connections");
        self.serve(listener, shutdown).await
    }

    /// Accept connections from `listener` until `shutdown` flips to true
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let cleanup = spawn_cleanup(
            Arc::clone(&self.bridge),
            self.config.cleanup_interval,
            shutdown.clone(),
        );

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
                _ = shutdown.changed() => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
            };

            if self.connection_states.len() >= self.config.max_connections {
                warn!(
                    limit = self.config.max_connections,
                    "Connection limit reached, rejecting new connection"
                );
                drop(stream);
                continue;
            }

            let conn_id = ConnectionId::new();
            let peer = addr.ip().to_string();
            info!(
                conn_id = %conn_id,
                peer = %peer,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            // Tracked before the handler exists, so its removal on exit
            // always finds the entry
            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer: peer.clone(),
                    session: None,
                    abort_handle: None,
                },
            );

            let task_handle = tokio::spawn(
                handle_connection(
                    conn_id,
                    stream,
                    peer,
                    Arc::clone(&self.bridge),
                    self.config.client_channel_capacity,
                    Arc::clone(&self.connection_states),
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );
            if let Some(mut state) = self.connection_states.get_mut(&conn_id) {
                state.abort_handle = Some(task_handle.abort_handle());
            }
        }

        cleanup.abort();
        self.shutdown();
        Ok(())
    }

    /// Abort every connection handler
    fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, state)) = self.connection_states.remove(&conn_id) {
                if let Some(session) = &state.session {
                    self.bridge.session_closed(session, conn_id);
                }
                debug!(
                    conn_id = %conn_id,
                    peer = %state.peer,
                    uptime_secs = state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                if let Some(abort_handle) = &state.abort_handle {
                    abort_handle.abort();
                }
            }
        }

        info!("Shutdown complete");
    }
}

fn spawn_cleanup(
    bridge: Arc<Bridge>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = bridge.cleanup_sessions();
                    if expired > 0 {
                        debug!(expired, "Forgot idle sessions");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Handle a single client connection
///
/// Reads client frames and hands them to the bridge, while forwarding
/// messages queued for this connection's session back to the client.
async fn handle_connection(
    conn_id: ConnectionId,
    stream: TcpStream,
    peer: String,
    bridge: Arc<Bridge>,
    channel_capacity: usize,
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake failed");
            connection_states.remove(&conn_id);
            return;
        }
    };
    info!("Connection handler started");

    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::channel::<BridgeMessage>(channel_capacity);
    let mut client = ClientContext {
        conn_id,
        peer,
        tx,
        session: None,
    };

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let flow = handle_client_text(&bridge, &mut client, &text);
                    if let Some(session) = &client.session {
                        if let Some(mut state) = connection_states.get_mut(&conn_id) {
                            state.session = Some(session.clone());
                        }
                    }
                    match flow {
                        Flow::Continue => {}
                        Flow::Reply(message) => {
                            if send_message(&mut write, &message).await.is_err() {
                                break;
                            }
                        }
                        Flow::Close(message) => {
                            let _ = send_message(&mut write, &message).await;
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client disconnected");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Read error");
                    break;
                }
            },

            outgoing = rx.recv() => match outgoing {
                Some(message) => {
                    if send_message(&mut write, &message).await.is_err() {
                        break;
                    }
                }
                None => {
                    info!("Session channel closed");
                    break;
                }
            },
        }
    }

    if let Some(session) = &client.session {
        bridge.session_closed(session, conn_id);
    }
    connection_states.remove(&conn_id);

    info!(
        active_connections = connection_states.len(),
        "Connection handler finished"
    );
}

async fn send_message<S>(write: &mut S, message: &BridgeMessage) -> Result<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = message.to_json().context("Failed to encode message")?;
    write.send(Message::Text(text)).await.map_err(|e| {
        warn!(error = %e, "Write error");
        anyhow::Error::from(e)
    })
}

/// Per-connection state seen by the frame handler
struct ClientContext {
    conn_id: ConnectionId,
    peer: String,
    tx: mpsc::Sender<BridgeMessage>,
    session: Option<SessionId>,
}

/// What the connection loop does after a client frame
#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Reply(BridgeMessage),
    Close(BridgeMessage),
}

fn protocol_error(message: impl Into<String>) -> BridgeMessage {
    BridgeMessage::Error {
        message: message.into(),
    }
}

fn handle_client_text(bridge: &Arc<Bridge>, client: &mut ClientContext, text: &str) -> Flow {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Malformed client frame");
            return Flow::Reply(protocol_error(format!("invalid message: {e}")));
        }
    };

    match message {
        ClientMessage::Register { session_id, token } => {
            if let Err(e) = bridge.authorize(token.as_deref()) {
                warn!(peer = %client.peer, error = %e, "Registration rejected");
                return Flow::Close(protocol_error(e.to_string()));
            }
            if session_id.trim().is_empty() {
                return Flow::Reply(protocol_error("sessionId must not be empty"));
            }

            let session_id = SessionId::new(session_id);
            if let Some(previous) = client.session.take() {
                if previous != session_id {
                    bridge.session_closed(&previous, client.conn_id);
                }
            }
            let drained = bridge.register_session(
                &session_id,
                SessionHandle::new(client.conn_id, client.tx.clone()),
            );
            info!(session_id = %session_id, drained, "Session registered");
            client.session = Some(session_id);
            Flow::Continue
        }

        ClientMessage::Task { text } => {
            let Some(session_id) = client.session.clone() else {
                return Flow::Reply(protocol_error("register before sending tasks"));
            };
            if text.trim().is_empty() {
                return Flow::Reply(protocol_error("task text must not be empty"));
            }
            // Rejections already reached the session as error results
            if let Err(e) = bridge.submit_task(&session_id, &client.peer, &text) {
                debug!(session_id = %session_id, error = %e, "Task not admitted");
            }
            Flow::Continue
        }

        ClientMessage::Reset => {
            if client.session.is_none() {
                return Flow::Reply(protocol_error("register before resetting"));
            }
            let bridge = Arc::clone(bridge);
            let tx = client.tx.clone();
            tokio::spawn(
                async move {
                    match bridge.reset_session().await {
                        Ok(_) => info!("Conversation reset"),
                        Err(BridgeError::ShuttingDown) => {}
                        Err(e) => {
                            warn!(error = %e, "Conversation reset failed");
                            let _ = tx.try_send(protocol_error(e.user_message()));
                        }
                    }
                }
                .in_current_span(),
            );
            Flow::Continue
        }

        ClientMessage::PushSubscribe { subscription } => {
            let Some(session_id) = &client.session else {
                return Flow::Reply(protocol_error("register before subscribing to push"));
            };
            if bridge.subscribe_push(session_id, subscription) {
                Flow::Continue
            } else {
                Flow::Reply(protocol_error("push notifications are disabled"))
            }
        }

        ClientMessage::PushUnsubscribe => {
            if let Some(session_id) = &client.session {
                bridge.unsubscribe_push(session_id);
            }
            Flow::Continue
        }
    }
}
