//! The bridge orchestrator
//!
//! [`Bridge`] owns every component and is what the daemon talks to. It
//! accepts client tasks, dispatches inbound gateway frames, and exposes the
//! accessors the client server needs.
//!
//! ```text
//!  client task ──▶ RateLimiter ──▶ RunTracker.begin(r1) ──▶ Correlator.call_with_id(r1)
//!                                                                 │
//!                                                           GatewayLink
//!                                                                 │
//!  inbound frame ──▶ dispatch ──┬─ response r1 {runId:u1} ─▶ RunTracker.rekey ─▶ Correlator.resolve
//!                               ├─ agent u1 ────────────────▶ RunTracker ─▶ Deliverer
//!                               └─ notification ────────────▶ SessionRegistry.broadcast / Deliverer
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::auth::{AuthError, SharedSecret};
use crate::config::BridgeConfig;
use crate::correlator::{CorrelatorMetrics, RequestCorrelator};
use crate::delivery::push::{PushNotifier, PushRegistry, PushSubscription, WebhookPushNotifier};
use crate::delivery::{Deliverer, DeliveryBuffer};
use crate::error::{BridgeError, Result};
use crate::gateway::{ClientInfo, FrameHandler, FrameSink, GatewayLink, LinkConfig, LinkMetrics};
use crate::protocol::{BridgeMessage, GatewayEvent, InboundFrame};
use crate::rate_limit::{RateLimitMetrics, RateLimitResult, RateLimiter};
use crate::runs::{RekeyOutcome, RunMetrics, RunTracker, TaskId};
use crate::sessions::{ConnectionId, RegistrySummary, SessionHandle, SessionId, SessionRegistry};

/// Gateway method that starts an agent run
const METHOD_CHAT_SEND: &str = "chat.send";
/// Gateway method that resets the conversation
const METHOD_SESSIONS_RESET: &str = "sessions.reset";

/// Serializable snapshot of bridge state
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    /// Seconds since the bridge was created
    pub uptime_secs: u64,
    /// Whether the gateway handshake is complete
    pub gateway_connected: bool,
    /// Link counters, when the bridge owns a link
    pub gateway: Option<LinkMetrics>,
    /// Session counts
    pub sessions: RegistrySummary,
    /// Correlator counters
    pub requests: CorrelatorMetrics,
    /// Run counters
    pub runs: RunMetrics,
    /// Results waiting for offline sessions
    pub buffered_results: usize,
    /// Registered push subscriptions
    pub push_subscriptions: usize,
    /// Rate limiter counters
    pub rate_limit: RateLimitMetrics,
    /// Tasks accepted since start
    pub tasks_submitted: u64,
}

/// Wires the gateway link, correlator, run tracker and session delivery
pub struct Bridge {
    session_key: String,
    request_timeout: Duration,
    session_idle_ttl: Duration,
    link: Option<GatewayLink>,
    sink: Arc<dyn FrameSink>,
    correlator: RequestCorrelator,
    runs: RunTracker,
    sessions: SessionRegistry,
    deliverer: Deliverer,
    push: Option<Arc<PushRegistry>>,
    rate_limiter: Arc<RateLimiter>,
    client_secret: Option<SharedSecret>,
    started_at: Instant,
    shutdown_tx: watch::Sender<bool>,
    shutting_down: AtomicBool,
    tasks_submitted: AtomicU64,
}

impl Bridge {
    /// Build a bridge with a real gateway link and webhook push delivery
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeliveryFailure`] if the push HTTP client
    /// cannot be built.
    pub fn new(config: &BridgeConfig) -> Result<Arc<Self>> {
        let link = GatewayLink::new(LinkConfig {
            url: config.gateway.url.clone(),
            token: config.gateway.token.clone(),
            client: ClientInfo::default(),
            connect_timeout: config.gateway.connect_timeout,
            reconnect_base: config.gateway.reconnect_delay,
            reconnect_max: config.gateway.reconnect_max_delay,
        });

        let notifier: Option<Arc<dyn PushNotifier>> = if config.delivery.push_enabled {
            if config.delivery.push_endpoint.is_none() {
                tracing::warn!("Push enabled without a relay, payloads go unencrypted to subscription endpoints");
            }
            let webhook = WebhookPushNotifier::new(
                config.delivery.push_endpoint.clone(),
                config.delivery.push_timeout,
            )?;
            Some(Arc::new(webhook))
        } else {
            None
        };

        let sink: Arc<dyn FrameSink> = Arc::new(link.clone());
        Ok(Self::build(config, Some(link), sink, notifier))
    }

    /// Build a bridge sending through `sink` instead of owning a link
    ///
    /// Inbound frames are then fed with [`handle_frame`](Self::handle_frame).
    #[must_use]
    pub fn with_sink(
        config: &BridgeConfig,
        sink: Arc<dyn FrameSink>,
        notifier: Option<Arc<dyn PushNotifier>>,
    ) -> Arc<Self> {
        Self::build(config, None, sink, notifier)
    }

    fn build(
        config: &BridgeConfig,
        link: Option<GatewayLink>,
        sink: Arc<dyn FrameSink>,
        notifier: Option<Arc<dyn PushNotifier>>,
    ) -> Arc<Self> {
        let sessions = SessionRegistry::new();
        let buffer = Arc::new(DeliveryBuffer::new(config.delivery.buffer_capacity));
        let push = notifier.map(|n| Arc::new(PushRegistry::new(n)));
        let deliverer = Deliverer::new(sessions.clone(), buffer, push.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            session_key: config.gateway.session_key.clone(),
            request_timeout: config.gateway.request_timeout,
            session_idle_ttl: config.server.session_idle_ttl,
            link,
            correlator: RequestCorrelator::new(Arc::clone(&sink)),
            sink,
            runs: RunTracker::new(config.gateway.session_key.clone()),
            sessions,
            deliverer,
            push,
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            client_secret: config
                .server
                .client_token
                .as_deref()
                .and_then(SharedSecret::new),
            started_at: Instant::now(),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
            tasks_submitted: AtomicU64::new(0),
        })
    }

    /// Connect the gateway link and start background maintenance
    pub fn start(self: &Arc<Self>) {
        if let Some(link) = &self.link {
            link.on_frame(Arc::new(Dispatcher {
                bridge: Arc::downgrade(self),
            }));
            link.connect();
        }
        self.rate_limiter.spawn_sweeper(self.shutdown_tx.subscribe());
        tracing::info!(session_key = %self.session_key, "Bridge started");
    }

    // =========================================================================
    // Inbound gateway frames
    // =========================================================================

    /// Dispatch one inbound gateway frame
    ///
    /// Responses re-key their run before the waiting caller is resolved, so
    /// stream events that follow always find the run under its run id.
    pub fn handle_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Response(response) => {
                if let Some(run_id) = response.run_id() {
                    if let RekeyOutcome::Completed(completed) = self.runs.rekey(&response.id, run_id) {
                        self.deliverer
                            .deliver(&completed.session_id, completed.to_message());
                    }
                }
                self.correlator.resolve(&response.id, response.outcome);
            }
            InboundFrame::Event(GatewayEvent::Agent(event)) => {
                let completed = self
                    .runs
                    .on_agent_event(&event, || self.sessions.most_recent_session());
                if let Some(completed) = completed {
                    self.deliverer
                        .deliver(&completed.session_id, completed.to_message());
                }
            }
            InboundFrame::Event(GatewayEvent::Notification { text }) => {
                self.fan_out_notification(text);
            }
            InboundFrame::Event(GatewayEvent::ConnectChallenge { .. }) => {
                tracing::debug!("Connect challenge reached the bridge, ignoring");
            }
            InboundFrame::Event(GatewayEvent::Other { name }) => {
                tracing::trace!(event = %name, "Unhandled gateway event");
            }
        }
    }

    fn fan_out_notification(&self, text: String) {
        let message = BridgeMessage::notification(text);
        let result = self.sessions.broadcast(&message, None);

        let mut unreached = self.sessions.offline_sessions();
        unreached.extend(result.failed_ids);
        for session_id in &unreached {
            self.deliverer.deliver(session_id, message.clone());
        }

        tracing::info!(
            delivered = result.successful,
            buffered = unreached.len(),
            "Notification fanned out"
        );
    }

    // =========================================================================
    // Client-facing operations
    // =========================================================================

    /// Check a client's registration token against the configured secret
    ///
    /// # Errors
    ///
    /// Fails when a secret is configured and the token is missing or wrong.
    pub fn authorize(&self, token: Option<&str>) -> std::result::Result<(), AuthError> {
        match &self.client_secret {
            Some(secret) => secret.check(token),
            None => Ok(()),
        }
    }

    /// Attach a client connection to a session and flush its buffer
    ///
    /// The `registered` acknowledgement is queued ahead of the buffered
    /// results. Returns the number of buffered results sent.
    pub fn register_session(&self, session_id: &SessionId, handle: SessionHandle) -> usize {
        let waiting = self.deliverer.buffer().len(session_id);
        self.sessions.register(session_id.clone(), handle);

        let ack = BridgeMessage::Registered {
            session_id: session_id.to_string(),
            drained: waiting,
        };
        if !self.sessions.send(session_id, ack) {
            tracing::warn!(session_id = %session_id, "Could not acknowledge registration");
        }

        self.deliverer.drain_on_reconnect(session_id)
    }

    /// The connection serving `session_id` closed
    pub fn session_closed(&self, session_id: &SessionId, connection_id: ConnectionId) {
        self.sessions.detach(session_id, connection_id);
    }

    /// Detach closed transports and forget sessions idle past the TTL
    ///
    /// Returns the number of sessions forgotten.
    pub fn cleanup_sessions(&self) -> usize {
        self.cleanup_sessions_at(Instant::now())
    }

    /// [`cleanup_sessions`](Self::cleanup_sessions) against an explicit clock
    pub fn cleanup_sessions_at(&self, now: Instant) -> usize {
        self.sessions.cleanup_disconnected();
        let expired = self.sessions.expire_idle_at(now, self.session_idle_ttl);
        for session_id in &expired {
            self.deliverer.buffer().clear(session_id);
            self.unsubscribe_push(session_id);
        }

        // Results for sessions that were never registered, or that expired
        // while a run was in flight
        for session_id in self.deliverer.buffer().sessions() {
            if !self.sessions.contains(&session_id) {
                tracing::debug!(session_id = %session_id, "Dropping results for unknown session");
                self.deliverer.buffer().clear(&session_id);
            }
        }
        expired.len()
    }

    /// Accept a task from `session_id`, rate limited by `source`
    ///
    /// The outcome always reaches the session as a `result` message, including
    /// rejections. An `Err` tells the caller the task was not admitted.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ShuttingDown`] or [`BridgeError::RateLimited`].
    pub fn submit_task(self: &Arc<Self>, session_id: &SessionId, source: &str, text: &str) -> Result<TaskId> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BridgeError::ShuttingDown);
        }

        if let RateLimitResult::Rejected { retry_after } = self.rate_limiter.admit(source) {
            let err = BridgeError::RateLimited { retry_after };
            let task_id = TaskId::new();
            tracing::warn!(session_id = %session_id, source, ?retry_after, "Task rate limited");
            self.deliverer.deliver(
                session_id,
                BridgeMessage::failed_result(task_id.as_str(), err.user_message()),
            );
            return Err(err);
        }

        let request_id = self.correlator.next_request_id();
        let task_id = self.runs.begin(&request_id, session_id.clone());
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            session_id = %session_id,
            task_id = %task_id,
            request_id = %request_id,
            "Task accepted"
        );

        let params = json!({
            "sessionKey": self.session_key,
            "message": text,
            "idempotencyKey": task_id.as_str(),
        });
        let bridge = Arc::clone(self);
        let session_id = session_id.clone();
        let returned = task_id.clone();
        tokio::spawn(async move {
            let outcome = bridge
                .correlator
                .call_with_id(request_id.clone(), METHOD_CHAT_SEND, params, bridge.request_timeout)
                .await;
            bridge.finish_submission(&request_id, &session_id, &task_id, outcome);
        });

        Ok(returned)
    }

    /// Report a failed submission unless the run was re-keyed, then hand
    /// out run results no remaining request can claim
    fn finish_submission(
        &self,
        request_id: &str,
        session_id: &SessionId,
        task_id: &TaskId,
        outcome: Result<Value>,
    ) {
        // A re-keyed run has left the request id behind and finishes
        // through its stream events
        if self.runs.discard(request_id).is_some() {
            self.report_unstarted(session_id, task_id, outcome);
        }

        for completed in self.runs.release_held(|| self.sessions.most_recent_session()) {
            self.deliverer
                .deliver(&completed.session_id, completed.to_message());
        }
    }

    fn report_unstarted(&self, session_id: &SessionId, task_id: &TaskId, outcome: Result<Value>) {
        let message = match outcome {
            Ok(_) => "The assistant accepted the task but did not start it.".to_string(),
            Err(BridgeError::ShuttingDown) => return,
            Err(err) => {
                tracing::warn!(
                    session_id = %session_id,
                    task_id = %task_id,
                    error = %err,
                    "Task failed before a run started"
                );
                err.user_message()
            }
        };
        self.deliverer
            .deliver(session_id, BridgeMessage::failed_result(task_id.as_str(), message));
    }

    /// Ask the gateway to reset the conversation
    ///
    /// # Errors
    ///
    /// Propagates the correlator's connection, timeout or upstream error.
    pub async fn reset_session(&self) -> Result<Value> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BridgeError::ShuttingDown);
        }
        self.correlator
            .call(
                METHOD_SESSIONS_RESET,
                json!({ "sessionKey": self.session_key }),
                self.request_timeout,
            )
            .await
    }

    /// Register a push subscription; false when push is disabled
    pub fn subscribe_push(&self, session_id: &SessionId, subscription: PushSubscription) -> bool {
        match &self.push {
            Some(push) => {
                push.subscribe(session_id.clone(), subscription);
                true
            }
            None => false,
        }
    }

    /// Remove the session's push subscription
    pub fn unsubscribe_push(&self, session_id: &SessionId) -> bool {
        self.push
            .as_ref()
            .and_then(|push| push.unsubscribe(session_id))
            .is_some()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Whether the gateway handshake is complete
    #[must_use]
    pub fn is_gateway_connected(&self) -> bool {
        self.sink.is_connected()
    }

    /// Number of sessions with a live connection
    #[must_use]
    pub fn active_session_count(&self) -> usize {
        self.sessions.active_session_count()
    }

    /// The session registry
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Snapshot of counters
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            uptime_secs: self.started_at.elapsed().as_secs(),
            gateway_connected: self.is_gateway_connected(),
            gateway: self.link.as_ref().map(GatewayLink::metrics),
            sessions: self.sessions.summary(),
            requests: self.correlator.metrics(),
            runs: self.runs.metrics(),
            buffered_results: self.deliverer.buffer().total(),
            push_subscriptions: self.push.as_ref().map_or(0, |p| p.count()),
            rate_limit: self.rate_limiter.metrics(),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
        }
    }

    /// Stop reconnecting, reject pending requests and drop unfinished runs
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        if let Some(link) = &self.link {
            link.shutdown();
        }
        let rejected = self.correlator.reject_all(&BridgeError::ShuttingDown);
        let discarded = self.runs.discard_all();
        tracing::info!(rejected, discarded, "Bridge shut down");
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("session_key", &self.session_key)
            .field("link", &self.link)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

/// Frame handler registered with the link
struct Dispatcher {
    bridge: Weak<Bridge>,
}

impl FrameHandler for Dispatcher {
    fn handle_frame(&self, frame: InboundFrame) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.handle_frame(frame);
        }
    }
}
