//! Session Registry - Client Session Management
//!
//! Maps logical session ids, chosen by the voice client, to the transport of
//! the connection currently serving them. A session outlives its connections:
//! when the browser reloads or the network drops, the session stays known
//! (offline) so results can be buffered for it, and the next `register` for
//! the same id attaches the new transport. Sessions that stay offline past
//! an idle TTL are forgotten by [`SessionRegistry::expire_idle_at`].
//!
//! # Architecture
//!
//! ```text
//!                        SessionRegistry
//!               ┌─────────────────────────────────────┐
//!               │ HashMap<SessionId, ClientSession>   │
//!               │   - wrapped in Arc<RwLock<>>        │
//!               └──────────────┬──────────────────────┘
//!                              │
//!          ┌───────────────────┼────────────────────┐
//!          │                   │                    │
//!   ┌──────▼──────┐     ┌──────▼──────┐      ┌──────▼──────┐
//!   │  kitchen    │     │   phone     │      │   laptop    │
//!   │  conn-3     │     │  (offline)  │      │   conn-7    │
//!   └─────────────┘     └─────────────┘      └─────────────┘
//! ```
//!
//! # Thread Safety
//!
//! Every send goes through a bounded channel with `try_send`, so the lock is
//! never held across I/O or an `.await`. A slow client loses messages instead
//! of stalling the gateway reader.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::protocol::BridgeMessage;

/// Logical session identifier chosen by the client
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a client-provided id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a client connection
///
/// Stable for the lifetime of one WebSocket connection. A session keeps its
/// id across reconnects; the connection id changes every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Create a connection ID from a raw value (for testing)
    #[cfg(test)]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound half of a live client connection
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Connection this handle writes to
    pub connection_id: ConnectionId,
    /// Channel drained by the connection's writer task
    pub tx: mpsc::Sender<BridgeMessage>,
    /// When the connection was accepted
    pub connected_at: Instant,
}

impl SessionHandle {
    /// Create a new session handle
    #[must_use]
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<BridgeMessage>) -> Self {
        Self {
            connection_id,
            tx,
            connected_at: Instant::now(),
        }
    }

    /// Try to send a message without waiting
    ///
    /// Returns true if the message was queued.
    #[must_use]
    pub fn try_send(&self, message: BridgeMessage) -> bool {
        self.tx.try_send(message).is_ok()
    }

    /// Check if the connection's channel is still open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A known client session
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Session id
    pub id: SessionId,
    /// Live transport, if any
    pub transport: Option<SessionHandle>,
    /// Last registration time
    pub registered_at: Instant,
    /// Registration order, higher is more recent
    pub seq: u64,
    /// When the last transport went away, unset while live
    pub disconnected_at: Option<Instant>,
}

impl ClientSession {
    /// Whether the session has a transport whose channel is open
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.transport.as_ref().is_some_and(SessionHandle::is_connected)
    }
}

/// Result of a broadcast operation
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    /// Sessions that accepted the message
    pub successful: usize,
    /// Sessions whose channel was full or closed
    pub failed: usize,
    /// Ids of the sessions that failed
    pub failed_ids: Vec<SessionId>,
}

impl BroadcastResult {
    /// Check if all recipients received the message
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Check if no recipients received the message
    #[must_use]
    pub fn all_failed(&self) -> bool {
        self.successful == 0
    }
}

/// Registry of client sessions and their live transports
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<SessionId, ClientSession>>>,
    next_seq: Arc<AtomicU64>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attach `handle` to `session_id`
    ///
    /// Any transport already serving the session is replaced and returned.
    pub fn register(&self, session_id: SessionId, handle: SessionHandle) -> Option<SessionHandle> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let connection_id = handle.connection_id;
        let mut inner = self.inner.write();

        let replaced = match inner.get_mut(&session_id) {
            Some(session) => {
                session.registered_at = Instant::now();
                session.seq = seq;
                session.disconnected_at = None;
                session.transport.replace(handle)
            }
            None => {
                inner.insert(
                    session_id.clone(),
                    ClientSession {
                        id: session_id.clone(),
                        transport: Some(handle),
                        registered_at: Instant::now(),
                        seq,
                        disconnected_at: None,
                    },
                );
                None
            }
        };

        match &replaced {
            Some(old) => tracing::info!(
                session_id = %session_id,
                connection_id = %connection_id,
                replaced = %old.connection_id,
                "Session re-registered, previous transport replaced"
            ),
            None => tracing::info!(
                session_id = %session_id,
                connection_id = %connection_id,
                "Session registered"
            ),
        }
        replaced
    }

    /// Forget a session entirely
    pub fn unregister(&self, session_id: &SessionId) -> Option<ClientSession> {
        let removed = self.inner.write().remove(session_id);
        if removed.is_some() {
            tracing::info!(session_id = %session_id, "Session unregistered");
        }
        removed
    }

    /// Clear the session's transport if `connection_id` still owns it
    ///
    /// The session stays known so results can be buffered for it. Returns
    /// true if the transport was detached.
    pub fn detach(&self, session_id: &SessionId, connection_id: ConnectionId) -> bool {
        let mut inner = self.inner.write();
        let Some(session) = inner.get_mut(session_id) else {
            return false;
        };
        let owned = session
            .transport
            .as_ref()
            .is_some_and(|t| t.connection_id == connection_id);
        if owned {
            session.transport = None;
            session.disconnected_at = Some(Instant::now());
            tracing::info!(
                session_id = %session_id,
                connection_id = %connection_id,
                "Session transport detached"
            );
        }
        owned
    }

    /// Send to one session
    ///
    /// Returns false when the session is unknown, offline, or its channel is
    /// full.
    #[must_use]
    pub fn send(&self, session_id: &SessionId, message: BridgeMessage) -> bool {
        let inner = self.inner.read();
        inner
            .get(session_id)
            .and_then(|s| s.transport.as_ref())
            .is_some_and(|t| t.try_send(message))
    }

    /// Send to every live session except `exclude`
    #[must_use]
    pub fn broadcast(&self, message: &BridgeMessage, exclude: Option<&SessionId>) -> BroadcastResult {
        let inner = self.inner.read();
        let mut result = BroadcastResult::default();

        for (id, session) in inner.iter() {
            if exclude == Some(id) {
                continue;
            }
            let Some(transport) = session.transport.as_ref() else {
                continue;
            };
            if transport.try_send(message.clone()) {
                result.successful += 1;
            } else {
                result.failed += 1;
                result.failed_ids.push(id.clone());
            }
        }

        result
    }

    /// Whether the session has an open transport
    #[must_use]
    pub fn is_live(&self, session_id: &SessionId) -> bool {
        self.inner
            .read()
            .get(session_id)
            .is_some_and(ClientSession::is_live)
    }

    /// Check if a session is known, live or not
    #[must_use]
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.inner.read().contains_key(session_id)
    }

    /// Number of sessions with an open transport
    #[must_use]
    pub fn active_session_count(&self) -> usize {
        self.inner.read().values().filter(|s| s.is_live()).count()
    }

    /// Number of known sessions
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// The session registered last
    #[must_use]
    pub fn most_recent_session(&self) -> Option<SessionId> {
        self.inner
            .read()
            .values()
            .max_by_key(|s| s.seq)
            .map(|s| s.id.clone())
    }

    /// Known sessions without an open transport
    #[must_use]
    pub fn offline_sessions(&self) -> Vec<SessionId> {
        self.inner
            .read()
            .values()
            .filter(|s| !s.is_live())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Detach transports whose channel has closed
    ///
    /// Returns the number of transports detached.
    pub fn cleanup_disconnected(&self) -> usize {
        let mut inner = self.inner.write();
        let mut detached = 0;

        for session in inner.values_mut() {
            let closed = session.transport.as_ref().is_some_and(|t| !t.is_connected());
            if closed {
                tracing::info!(session_id = %session.id, "Detaching closed transport");
                session.transport = None;
                session.disconnected_at = Some(Instant::now());
                detached += 1;
            }
        }

        if detached > 0 {
            tracing::info!(
                detached = detached,
                remaining_live = inner.values().filter(|s| s.is_live()).count(),
                "Cleaned up disconnected sessions"
            );
        }
        detached
    }

    /// Forget offline sessions that have been disconnected for at least `ttl`
    ///
    /// Returns the ids removed so their buffered results can be dropped.
    pub fn expire_idle_at(&self, now: Instant, ttl: Duration) -> Vec<SessionId> {
        let mut inner = self.inner.write();
        let expired: Vec<SessionId> = inner
            .values()
            .filter(|s| !s.is_live())
            .filter(|s| {
                let since = s.disconnected_at.unwrap_or(s.registered_at);
                now.saturating_duration_since(since) >= ttl
            })
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            inner.remove(id);
        }
        if !expired.is_empty() {
            tracing::info!(
                expired = expired.len(),
                remaining = inner.len(),
                "Forgot idle sessions"
            );
        }
        expired
    }

    /// Get a summary of known sessions
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let inner = self.inner.read();
        let live_sessions = inner.values().filter(|s| s.is_live()).count();
        RegistrySummary {
            total_sessions: inner.len(),
            live_sessions,
            offline_sessions: inner.len() - live_sessions,
        }
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SessionRegistry")
            .field("session_count", &inner.len())
            .field("sessions", &inner.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Summary of known sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
    /// Known sessions
    pub total_sessions: usize,
    /// Sessions with an open transport
    pub live_sessions: usize,
    /// Sessions without one
    pub offline_sessions: usize,
}
