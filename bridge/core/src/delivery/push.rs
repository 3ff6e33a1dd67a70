//! Push notification fallback
//!
//! When a result is buffered for an offline session, the bridge also tries a
//! best-effort push so the user learns something is waiting. Delivery goes
//! through the [`PushNotifier`] seam; [`WebhookPushNotifier`] POSTs JSON over
//! HTTP, either straight to the subscription endpoint or to a relay that
//! performs Web Push encryption.
//!
//! An endpoint answering 404 or 410 is gone for good and its subscription is
//! dropped. Every other failure is logged and the subscription kept.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::BridgeError;
use crate::protocol::BridgeMessage;
use crate::sessions::SessionId;

/// Longest push body, in characters
const MAX_BODY_CHARS: usize = 120;

/// Client keys of a Web Push subscription
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushKeys {
    /// Client public key
    #[serde(default)]
    pub p256dh: String,
    /// Client auth secret
    #[serde(default)]
    pub auth: String,
}

/// A push endpoint registered by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    /// Endpoint URL
    pub endpoint: String,
    /// Encryption keys
    #[serde(default)]
    pub keys: PushKeys,
}

/// Body of a push notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    /// Notification title
    pub title: String,
    /// Notification body
    pub body: String,
    /// Session the notification is for
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

impl PushPayload {
    /// Build a payload previewing `message`
    #[must_use]
    pub fn for_message(session_id: &SessionId, message: &BridgeMessage) -> Self {
        let (title, text) = match message {
            BridgeMessage::Result { error: true, .. } => ("Task failed", message.preview()),
            BridgeMessage::Result { .. } => ("Task finished", message.preview()),
            _ => ("New notification", message.preview()),
        };
        Self {
            title: title.to_string(),
            body: text.map(truncate_body).unwrap_or_default(),
            session_id: session_id.to_string(),
        }
    }
}

fn truncate_body(text: &str) -> String {
    if text.chars().count() <= MAX_BODY_CHARS {
        return text.to_string();
    }
    let mut body: String = text.chars().take(MAX_BODY_CHARS - 1).collect();
    body.push('…');
    body
}

/// Push delivery errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    /// The endpoint no longer exists (404 or 410)
    #[error("Push endpoint gone (status {status})")]
    Gone {
        /// HTTP status returned
        status: u16,
    },

    /// The endpoint refused the notification
    #[error("Push endpoint rejected notification (status {status}): {message}")]
    Rejected {
        /// HTTP status returned
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// The request never completed
    #[error("Push transport error: {0}")]
    Transport(String),
}

impl PushError {
    /// Whether the subscription should be dropped
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Gone { .. })
    }

    /// Classify an HTTP failure status
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            404 | 410 => Self::Gone { status },
            _ => Self::Rejected {
                status,
                message: message.into(),
            },
        }
    }
}

impl From<PushError> for BridgeError {
    fn from(err: PushError) -> Self {
        let status = match &err {
            PushError::Gone { status } | PushError::Rejected { status, .. } => Some(*status),
            PushError::Transport(_) => None,
        };
        BridgeError::DeliveryFailure {
            status,
            message: err.to_string(),
        }
    }
}

/// Delivers push notifications
#[async_trait]
pub trait PushNotifier: Send + Sync {
    /// Send `payload` to `subscription`
    async fn notify(
        &self,
        subscription: &PushSubscription,
        payload: &PushPayload,
    ) -> Result<(), PushError>;
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    subscription: &'a PushSubscription,
    payload: &'a PushPayload,
}

/// Push notifier that POSTs JSON over HTTP
#[derive(Debug, Clone)]
pub struct WebhookPushNotifier {
    client: reqwest::Client,
    relay: Option<String>,
}

impl WebhookPushNotifier {
    /// Create a notifier
    ///
    /// With a `relay` URL every notification is POSTed there together with
    /// its subscription, and the relay handles Web Push encryption with the
    /// subscription keys. Without one the payload goes to the subscription
    /// endpoint as plain JSON, which standard push services refuse.
    pub fn new(relay: Option<String>, timeout: Duration) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PushError::Transport(e.to_string()))?;
        Ok(Self { client, relay })
    }
}

#[async_trait]
impl PushNotifier for WebhookPushNotifier {
    async fn notify(
        &self,
        subscription: &PushSubscription,
        payload: &PushPayload,
    ) -> Result<(), PushError> {
        let request = match &self.relay {
            Some(relay) => self.client.post(relay).json(&RelayRequest {
                subscription,
                payload,
            }),
            None => self.client.post(&subscription.endpoint).json(payload),
        };

        let response = request
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(PushError::from_status(status.as_u16(), message))
    }
}

/// Push subscriptions by session, plus the notifier that serves them
pub struct PushRegistry {
    subscriptions: DashMap<SessionId, PushSubscription>,
    notifier: Arc<dyn PushNotifier>,
}

impl PushRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(notifier: Arc<dyn PushNotifier>) -> Self {
        Self {
            subscriptions: DashMap::new(),
            notifier,
        }
    }

    /// Register or replace the session's subscription
    pub fn subscribe(&self, session_id: SessionId, subscription: PushSubscription) {
        tracing::info!(session_id = %session_id, "Push subscription registered");
        self.subscriptions.insert(session_id, subscription);
    }

    /// Remove the session's subscription
    pub fn unsubscribe(&self, session_id: &SessionId) -> Option<PushSubscription> {
        self.subscriptions.remove(session_id).map(|(_, sub)| sub)
    }

    /// The session's subscription
    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<PushSubscription> {
        self.subscriptions.get(session_id).map(|s| s.value().clone())
    }

    /// Number of registered subscriptions
    #[must_use]
    pub fn count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Push a preview of `message` to the session, if it has a subscription
    ///
    /// Returns `Ok(false)` when there is nothing to push to.
    pub async fn dispatch(
        &self,
        session_id: &SessionId,
        message: &BridgeMessage,
    ) -> Result<bool, BridgeError> {
        let Some(subscription) = self.get(session_id) else {
            return Ok(false);
        };
        let payload = PushPayload::for_message(session_id, message);

        match self.notifier.notify(&subscription, &payload).await {
            Ok(()) => {
                tracing::debug!(session_id = %session_id, "Push notification sent");
                Ok(true)
            }
            Err(err) if err.is_permanent() => {
                // Only drop it if the client has not re-subscribed meanwhile
                self.subscriptions
                    .remove_if(session_id, |_, current| current.endpoint == subscription.endpoint);
                tracing::info!(
                    session_id = %session_id,
                    error = %err,
                    "Push endpoint gone, subscription removed"
                );
                Err(err.into())
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %err,
                    "Push notification failed, subscription kept"
                );
                Err(err.into())
            }
        }
    }
}

impl std::fmt::Debug for PushRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushRegistry")
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Notifier that records payloads and answers with a fixed outcome
    struct FakeNotifier {
        outcome: Result<(), PushError>,
        sent: Mutex<Vec<(String, PushPayload)>>,
    }

    impl FakeNotifier {
        fn new(outcome: Result<(), PushError>) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PushNotifier for FakeNotifier {
        async fn notify(
            &self,
            subscription: &PushSubscription,
            payload: &PushPayload,
        ) -> Result<(), PushError> {
            self.sent
                .lock()
                .push((subscription.endpoint.clone(), payload.clone()));
            self.outcome.clone()
        }
    }

    fn subscription(endpoint: &str) -> PushSubscription {
        PushSubscription {
            endpoint: endpoint.to_string(),
            keys: PushKeys::default(),
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(PushError::from_status(404, "").is_permanent());
        assert!(PushError::from_status(410, "").is_permanent());
        assert!(!PushError::from_status(500, "boom").is_permanent());
        assert!(!PushError::from_status(429, "slow down").is_permanent());
    }

    #[test]
    fn test_payload_preview_truncates() {
        let long = "x".repeat(300);
        let payload = PushPayload::for_message(
            &SessionId::from("s1"),
            &BridgeMessage::result("task-1", long),
        );
        assert_eq!(payload.title, "Task finished");
        assert_eq!(payload.body.chars().count(), MAX_BODY_CHARS);
    }

    #[tokio::test]
    async fn test_dispatch_without_subscription_is_noop() {
        let notifier = FakeNotifier::new(Ok(()));
        let registry = PushRegistry::new(notifier.clone());
        let sent = registry
            .dispatch(&"s1".into(), &BridgeMessage::result("t", "done"))
            .await
            .unwrap();
        assert!(!sent);
        assert!(notifier.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_gone_endpoint_removes_subscription() {
        let notifier = FakeNotifier::new(Err(PushError::Gone { status: 410 }));
        let registry = PushRegistry::new(notifier);
        registry.subscribe("s1".into(), subscription("https://push.example/1"));

        let err = registry
            .dispatch(&"s1".into(), &BridgeMessage::result("t", "done"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::DeliveryFailure {
                status: Some(410),
                message: "Push endpoint gone (status 410)".to_string(),
            }
        );
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_subscription() {
        let notifier = FakeNotifier::new(Err(PushError::from_status(503, "unavailable")));
        let registry = PushRegistry::new(notifier.clone());
        registry.subscribe("s1".into(), subscription("https://push.example/1"));

        assert!(registry
            .dispatch(&"s1".into(), &BridgeMessage::notification("hi"))
            .await
            .is_err());
        assert_eq!(registry.count(), 1);
        assert_eq!(notifier.sent.lock()[0].1.title, "New notification");
    }

    /// Serve one HTTP request with `status` and return the request body
    async fn serve_once(listener: TcpListener, status: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    let response =
                        format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                    socket.write_all(response.as_bytes()).await.unwrap();
                    return text[header_end + 4..].to_string();
                }
            }
            if n == 0 {
                return String::new();
            }
        }
    }

    #[tokio::test]
    async fn test_webhook_posts_payload_to_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/push", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_once(listener, "201 Created"));

        let notifier = WebhookPushNotifier::new(None, Duration::from_secs(5)).unwrap();
        let payload = PushPayload::for_message(&"s1".into(), &BridgeMessage::result("t", "done"));
        notifier
            .notify(&subscription(&endpoint), &payload)
            .await
            .unwrap();

        let body: PushPayload = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body, payload);
    }

    #[tokio::test]
    async fn test_webhook_maps_410_to_gone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/push", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_once(listener, "410 Gone"));

        let notifier = WebhookPushNotifier::new(None, Duration::from_secs(5)).unwrap();
        let payload = PushPayload::for_message(&"s1".into(), &BridgeMessage::notification("x"));
        let err = notifier
            .notify(&subscription(&endpoint), &payload)
            .await
            .unwrap_err();
        assert_eq!(err, PushError::Gone { status: 410 });
        server.await.unwrap();
    }
}
