//! Request/response correlation
//!
//! Every request sent to the gateway carries a locally generated id. The
//! correlator keeps one [`PendingRequest`] per id until exactly one of three
//! things happens: the matching response arrives, the expiry timer fires, or
//! the bridge shuts down. Whoever removes the entry from the map settles the
//! caller, so a request is never both resolved and rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{BridgeError, Result};
use crate::gateway::FrameSink;
use crate::protocol::{OutboundRequest, UpstreamError};

/// A request waiting for its response
#[derive(Debug)]
pub struct PendingRequest {
    /// Gateway method
    pub method: String,
    /// When the request was registered
    pub created_at: Instant,
    /// When the request times out
    pub expires_at: Instant,
    responder: oneshot::Sender<Result<Value>>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn settle(mut self, outcome: Result<Value>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // The caller may have given up already
        let _ = self.responder.send(outcome);
    }
}

type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// Correlates gateway responses with the calls that caused them
pub struct RequestCorrelator {
    sink: Arc<dyn FrameSink>,
    pending: PendingMap,
    next_id: AtomicU64,
    resolved: AtomicU64,
    timed_out: Arc<AtomicU64>,
}

impl RequestCorrelator {
    /// Create a correlator sending through `sink`
    #[must_use]
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            sink,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            resolved: AtomicU64::new(0),
            timed_out: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Allocate a fresh correlation id
    pub fn next_request_id(&self) -> String {
        format!("r{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Send `method` and wait for its response
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_request_id();
        self.call_with_id(id, method, params, timeout).await
    }

    /// Like [`call`](Self::call) with an id allocated beforehand
    pub async fn call_with_id(
        &self,
        id: String,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let rx = self.register(&id, method, timeout)?;

        let frame = OutboundRequest::new(id.clone(), method, params);
        if let Err(err) = self.sink.send_frame(&frame) {
            if let Some(entry) = self.pending.lock().remove(&id) {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            }
            tracing::debug!(request_id = %id, method, error = %err, "Request not sent");
            return Err(err);
        }
        tracing::debug!(request_id = %id, method, "Request sent");

        rx.await.unwrap_or(Err(BridgeError::ShuttingDown))
    }

    fn register(
        &self,
        id: &str,
        method: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();
        let expires_at = created_at + timeout;

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(id) {
                return Err(BridgeError::Protocol(format!("duplicate request id {id}")));
            }
            pending.insert(
                id.to_string(),
                PendingRequest {
                    method: method.to_string(),
                    created_at,
                    expires_at,
                    responder: tx,
                    timer: None,
                },
            );
        }

        let timer = {
            let pending = Arc::clone(&self.pending);
            let timed_out = Arc::clone(&self.timed_out);
            let id = id.to_string();
            let method = method.to_string();
            tokio::spawn(async move {
                tokio::time::sleep_until(expires_at).await;
                let entry = pending.lock().remove(&id);
                if let Some(mut entry) = entry {
                    // Dropping our own handle must not abort this task
                    entry.timer = None;
                    timed_out.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(request_id = %id, method = %method, ?timeout, "Request timed out");
                    entry.settle(Err(BridgeError::RequestTimeout { method, timeout }));
                }
            })
        };

        match self.pending.lock().get_mut(id) {
            Some(entry) => entry.timer = Some(timer),
            None => drop(timer),
        }
        Ok(rx)
    }

    /// Settle the request `id` with a response outcome
    ///
    /// Returns false when no request with that id is pending (already timed
    /// out, or never sent by us).
    pub fn resolve(&self, id: &str, outcome: std::result::Result<Value, UpstreamError>) -> bool {
        let entry = self.pending.lock().remove(id);
        match entry {
            Some(entry) => {
                self.resolved.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(request_id = %id, method = %entry.method, ok = outcome.is_ok(), "Response correlated");
                entry.settle(outcome.map_err(BridgeError::from));
                true
            }
            None => {
                tracing::debug!(request_id = %id, "Response for unknown request ignored");
                false
            }
        }
    }

    /// Reject every outstanding request with `error`
    ///
    /// Returns the number of requests rejected.
    pub fn reject_all(&self, error: &BridgeError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            entry.settle(Err(error.clone()));
        }
        if count > 0 {
            tracing::info!(count, error = %error, "Rejected pending requests");
        }
        count
    }

    /// Number of requests awaiting a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Counters for stats
    #[must_use]
    pub fn metrics(&self) -> CorrelatorMetrics {
        CorrelatorMetrics {
            pending: self.pending_count(),
            resolved: self.resolved.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

/// Correlator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CorrelatorMetrics {
    /// Requests awaiting a response
    pub pending: usize,
    /// Requests settled by a response
    pub resolved: u64,
    /// Requests settled by their timer
    pub timed_out: u64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    /// Sink that records frames instead of sending them
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) frames: Mutex<Vec<OutboundRequest>>,
        pub(crate) disconnected: AtomicBool,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: &OutboundRequest) -> Result<()> {
            if self.disconnected.load(Ordering::SeqCst) {
                return Err(BridgeError::Connection("not connected".to_string()));
            }
            self.frames.lock().push(frame.clone());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.disconnected.load(Ordering::SeqCst)
        }
    }

    fn correlator() -> (Arc<RequestCorrelator>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (Arc::new(RequestCorrelator::new(sink.clone())), sink)
    }

    async fn settle_tasks() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_resolves_call() {
        let (correlator, sink) = correlator();
        let caller = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .call("chat.send", json!({"message": "hi"}), Duration::from_secs(30))
                    .await
            })
        };
        settle_tasks().await;

        let id = sink.frames.lock()[0].id.clone();
        assert_eq!(id, "r1");
        assert!(correlator.resolve(&id, Ok(json!({"runId": "u1"}))));

        assert_eq!(caller.await.unwrap(), Ok(json!({"runId": "u1"})));
        assert_eq!(correlator.pending_count(), 0);
        // A second response for the same id finds nothing
        assert!(!correlator.resolve(&id, Ok(Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_clears_entry() {
        let (correlator, _sink) = correlator();
        let result = correlator
            .call("chat.send", json!({}), Duration::from_secs(5))
            .await;

        assert_eq!(
            result,
            Err(BridgeError::RequestTimeout {
                method: "chat.send".to_string(),
                timeout: Duration::from_secs(5),
            })
        );
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.resolve("r1", Ok(Value::Null)));
        assert_eq!(correlator.metrics().timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_error_rejects_call() {
        let (correlator, _sink) = correlator();
        let caller = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .call("sessions.reset", json!({}), Duration::from_secs(30))
                    .await
            })
        };
        settle_tasks().await;

        correlator.resolve(
            "r1",
            Err(UpstreamError {
                code: "NOT_FOUND".to_string(),
                message: "no such session".to_string(),
            }),
        );
        assert_eq!(
            caller.await.unwrap(),
            Err(BridgeError::Upstream {
                code: "NOT_FOUND".to_string(),
                message: "no such session".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_send_failure_leaves_no_entry() {
        let (correlator, sink) = correlator();
        sink.disconnected.store(true, Ordering::SeqCst);

        let result = correlator
            .call("chat.send", json!({}), Duration::from_secs(30))
            .await;
        assert!(matches!(result, Err(BridgeError::Connection(_))));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_all_on_shutdown() {
        let (correlator, _sink) = correlator();
        let mut callers = Vec::new();
        for _ in 0..3 {
            let correlator = Arc::clone(&correlator);
            callers.push(tokio::spawn(async move {
                correlator
                    .call("chat.send", json!({}), Duration::from_secs(30))
                    .await
            }));
        }
        settle_tasks().await;
        assert_eq!(correlator.pending_count(), 3);

        assert_eq!(correlator.reject_all(&BridgeError::ShuttingDown), 3);
        for caller in callers {
            assert_eq!(caller.await.unwrap(), Err(BridgeError::ShuttingDown));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_rejected() {
        let (correlator, _sink) = correlator();
        let first = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .call_with_id("fixed".to_string(), "a", json!({}), Duration::from_secs(30))
                    .await
            })
        };
        settle_tasks().await;

        let second = correlator
            .call_with_id("fixed".to_string(), "b", json!({}), Duration::from_secs(30))
            .await;
        assert!(matches!(second, Err(BridgeError::Protocol(_))));

        correlator.resolve("fixed", Ok(json!(1)));
        assert_eq!(first.await.unwrap(), Ok(json!(1)));
    }
}
