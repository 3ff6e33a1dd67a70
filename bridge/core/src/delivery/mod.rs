//! Result delivery with offline buffering
//!
//! [`Deliverer::deliver`] sends straight to a live session. When the session
//! has no open transport the message goes into a bounded per-session ring
//! ([`DeliveryBuffer`]) and a best-effort push is fired. The next time the
//! session registers, [`Deliverer::drain_on_reconnect`] flushes the ring in
//! FIFO order.

pub mod push;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::protocol::BridgeMessage;
use crate::sessions::{SessionId, SessionRegistry};

use self::push::PushRegistry;

/// Default number of results kept per offline session
pub const DEFAULT_BUFFER_CAPACITY: usize = 50;

/// A result waiting for its session to come back
#[derive(Debug, Clone)]
pub struct BufferedResult {
    /// Owning session
    pub session_id: SessionId,
    /// Message to deliver
    pub message: BridgeMessage,
    /// When it was buffered
    pub enqueued_at: Instant,
}

/// Bounded per-session FIFO of undelivered messages
#[derive(Debug)]
pub struct DeliveryBuffer {
    capacity: usize,
    queues: Mutex<HashMap<SessionId, VecDeque<BufferedResult>>>,
}

impl DeliveryBuffer {
    /// Create a buffer holding at most `capacity` messages per session
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Per-session capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a message, evicting the oldest when full
    ///
    /// Returns the evicted entry, if any.
    pub fn push(&self, session_id: &SessionId, message: BridgeMessage) -> Option<BufferedResult> {
        let mut queues = self.queues.lock();
        let queue = queues.entry(session_id.clone()).or_default();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(BufferedResult {
            session_id: session_id.clone(),
            message,
            enqueued_at: Instant::now(),
        });
        evicted
    }

    /// Remove and return everything buffered for the session
    pub fn take(&self, session_id: &SessionId) -> VecDeque<BufferedResult> {
        self.queues.lock().remove(session_id).unwrap_or_default()
    }

    /// Put entries back at the front, ahead of anything buffered meanwhile
    pub fn requeue_front(&self, session_id: &SessionId, entries: VecDeque<BufferedResult>) {
        if entries.is_empty() {
            return;
        }
        let mut queues = self.queues.lock();
        let queue = queues.entry(session_id.clone()).or_default();
        let mut merged = entries;
        merged.append(queue);
        while merged.len() > self.capacity {
            merged.pop_front();
        }
        *queue = merged;
    }

    /// Number of messages buffered for the session
    #[must_use]
    pub fn len(&self, session_id: &SessionId) -> usize {
        self.queues.lock().get(session_id).map_or(0, VecDeque::len)
    }

    /// Number of messages buffered across all sessions
    #[must_use]
    pub fn total(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }

    /// Drop everything buffered for the session
    pub fn clear(&self, session_id: &SessionId) {
        self.queues.lock().remove(session_id);
    }

    /// Sessions with buffered results
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionId> {
        self.queues.lock().keys().cloned().collect()
    }
}

/// How a message was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handed to the live transport
    Sent,
    /// Stored for later
    Buffered {
        /// Whether an older message was evicted to make room
        evicted: bool,
    },
}

/// Routes messages to live sessions or the offline buffer
#[derive(Debug, Clone)]
pub struct Deliverer {
    sessions: SessionRegistry,
    buffer: Arc<DeliveryBuffer>,
    push: Option<Arc<PushRegistry>>,
}

impl Deliverer {
    /// Create a deliverer
    #[must_use]
    pub fn new(
        sessions: SessionRegistry,
        buffer: Arc<DeliveryBuffer>,
        push: Option<Arc<PushRegistry>>,
    ) -> Self {
        Self {
            sessions,
            buffer,
            push,
        }
    }

    /// The offline buffer
    #[must_use]
    pub fn buffer(&self) -> &Arc<DeliveryBuffer> {
        &self.buffer
    }

    /// Deliver to the session now, or buffer it and fire a push
    pub fn deliver(&self, session_id: &SessionId, message: BridgeMessage) -> DeliveryOutcome {
        if self.sessions.send(session_id, message.clone()) {
            return DeliveryOutcome::Sent;
        }

        let evicted = self.buffer.push(session_id, message.clone()).is_some();
        if evicted {
            tracing::warn!(
                session_id = %session_id,
                capacity = self.buffer.capacity(),
                "Delivery buffer full, oldest result evicted"
            );
        } else {
            tracing::debug!(session_id = %session_id, "Result buffered for offline session");
        }

        self.spawn_push(session_id, message);
        DeliveryOutcome::Buffered { evicted }
    }

    fn spawn_push(&self, session_id: &SessionId, message: BridgeMessage) {
        let Some(push) = self.push.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No runtime available, skipping push");
            return;
        };
        let session_id = session_id.clone();
        runtime.spawn(async move {
            // Failures are already logged by the registry
            let _ = push.dispatch(&session_id, &message).await;
        });
    }

    /// Flush the session's buffer to its transport in FIFO order
    ///
    /// Stops at the first message the transport refuses; that message and
    /// everything after it go back to the front of the buffer. Returns the
    /// number of messages sent.
    pub fn drain_on_reconnect(&self, session_id: &SessionId) -> usize {
        let mut pending = self.buffer.take(session_id);
        let mut sent = 0;

        while let Some(entry) = pending.pop_front() {
            if self.sessions.send(session_id, entry.message.clone()) {
                sent += 1;
            } else {
                pending.push_front(entry);
                break;
            }
        }

        if !pending.is_empty() {
            tracing::warn!(
                session_id = %session_id,
                sent,
                requeued = pending.len(),
                "Drain interrupted, remaining results requeued"
            );
            self.buffer.requeue_front(session_id, pending);
        } else if sent > 0 {
            tracing::info!(session_id = %session_id, sent, "Drained buffered results");
        }
        sent
    }
}
