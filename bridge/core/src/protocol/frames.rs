//! Gateway wire frames
//!
//! The gateway speaks JSON text frames over a WebSocket. Three shapes matter:
//!
//! ```text
//! request   {"type":"req", "id", "method", "params"}          bridge -> gateway
//! response  {"id", "payload"|"result"} or {"id", "error"}     gateway -> bridge
//! event     {"type":"event", "event", "payload"}              gateway -> bridge
//! ```
//!
//! Inbound frames are parsed leniently: responses may carry an optional
//! `type:"res"` and `ok` flag, and the result may sit under either `payload`
//! or `result`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

// =============================================================================
// Outbound
// =============================================================================

/// A request frame sent to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    /// Always `"req"`
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Correlation id, unique per request
    pub id: String,
    /// Gateway method name
    pub method: String,
    /// Method parameters
    pub params: Value,
}

impl OutboundRequest {
    /// Build a request frame
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            frame_type: "req".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Error object carried by a failed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    /// Error code, rendered as a string whatever its JSON type
    pub code: String,
    /// Error message
    pub message: String,
}

impl From<UpstreamError> for BridgeError {
    fn from(err: UpstreamError) -> Self {
        BridgeError::Upstream {
            code: err.code,
            message: err.message,
        }
    }
}

/// A response to an earlier request
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    /// Correlation id of the request being answered
    pub id: String,
    /// Payload on success, error object on failure
    pub outcome: Result<Value, UpstreamError>,
}

impl ResponseFrame {
    /// Gateway-assigned run id carried by an accepted `chat.send`
    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        self.outcome
            .as_ref()
            .ok()
            .and_then(|payload| payload.get("runId"))
            .and_then(Value::as_str)
    }
}

/// Phase of a run's lifecycle stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// The run started
    Start,
    /// The run finished normally
    End,
    /// The run failed
    Error,
}

/// The `stream` discriminator of an `agent` event
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStream {
    /// Full text snapshot of the assistant output so far
    Assistant {
        /// Snapshot text (replaces, never appends)
        text: String,
    },
    /// Lifecycle transition
    Lifecycle {
        /// New phase
        phase: LifecyclePhase,
        /// Error message for the `error` phase
        error: Option<String>,
    },
    /// Any stream the bridge does not consume (tool calls, thinking, ...)
    Other(String),
}

/// An `agent` event belonging to a streaming run
#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
    /// Gateway-assigned run id
    pub run_id: String,
    /// Gateway session key the run belongs to
    pub session_key: Option<String>,
    /// Event content
    pub stream: AgentStream,
}

/// Events pushed by the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Handshake challenge; the connect request must echo the nonce
    ConnectChallenge {
        /// Challenge nonce
        nonce: String,
    },
    /// Streaming run event
    Agent(AgentEvent),
    /// Free-form notification to fan out to every session
    Notification {
        /// Text to show
        text: String,
    },
    /// Any other event (ticks, presence, ...)
    Other {
        /// Event name
        name: String,
    },
}

/// A classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Correlated response
    Response(ResponseFrame),
    /// Uncorrelated event
    Event(GatewayEvent),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: Option<String>,
    id: Option<Value>,
    event: Option<String>,
    ok: Option<bool>,
    payload: Option<Value>,
    result: Option<Value>,
    error: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAgentPayload {
    run_id: String,
    stream: String,
    #[serde(default)]
    data: Value,
    session_key: Option<String>,
}

impl InboundFrame {
    /// Classify a JSON text frame
    ///
    /// Frames with an event name are events, frames with a correlation id are
    /// responses, anything else is a protocol error.
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|e| BridgeError::Protocol(format!("invalid frame: {e}")))?;

        let is_event = raw.frame_type.as_deref() == Some("event") || raw.event.is_some();
        if is_event {
            let name = raw
                .event
                .ok_or_else(|| BridgeError::Protocol("event frame without name".to_string()))?;
            let payload = raw.payload.unwrap_or(Value::Null);
            return parse_event(name, payload).map(InboundFrame::Event);
        }

        let id = match raw.id {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(BridgeError::Protocol(
                    "frame has neither correlation id nor event name".to_string(),
                ))
            }
        };

        let outcome = match raw.error {
            Some(err) if !err.is_null() => Err(upstream_error(&err)),
            _ if raw.ok == Some(false) => Err(UpstreamError {
                code: "UNKNOWN".to_string(),
                message: "request failed".to_string(),
            }),
            _ => Ok(raw.payload.or(raw.result).unwrap_or(Value::Null)),
        };

        Ok(InboundFrame::Response(ResponseFrame { id, outcome }))
    }
}

fn upstream_error(err: &Value) -> UpstreamError {
    match err {
        Value::String(message) => UpstreamError {
            code: "UNKNOWN".to_string(),
            message: message.clone(),
        },
        other => {
            let code = match other.get("code") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => "UNKNOWN".to_string(),
            };
            let message = other
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| other.to_string(), str::to_string);
            UpstreamError { code, message }
        }
    }
}

fn parse_event(name: String, payload: Value) -> Result<GatewayEvent, BridgeError> {
    match name.as_str() {
        "connect.challenge" => {
            let nonce = payload
                .get("nonce")
                .and_then(Value::as_str)
                .ok_or_else(|| BridgeError::Protocol("challenge without nonce".to_string()))?;
            Ok(GatewayEvent::ConnectChallenge {
                nonce: nonce.to_string(),
            })
        }
        "agent" => parse_agent(payload).map(GatewayEvent::Agent),
        "notification" => Ok(GatewayEvent::Notification {
            text: notification_text(&payload),
        }),
        _ => Ok(GatewayEvent::Other { name }),
    }
}

fn parse_agent(payload: Value) -> Result<AgentEvent, BridgeError> {
    let raw: RawAgentPayload = serde_json::from_value(payload)
        .map_err(|e| BridgeError::Protocol(format!("invalid agent event: {e}")))?;

    let stream = match raw.stream.as_str() {
        "assistant" => {
            let text = raw
                .data
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| BridgeError::Protocol("assistant event without text".to_string()))?;
            AgentStream::Assistant {
                text: text.to_string(),
            }
        }
        "lifecycle" => match raw.data.get("phase").and_then(Value::as_str) {
            Some("start") => AgentStream::Lifecycle {
                phase: LifecyclePhase::Start,
                error: None,
            },
            Some("end") => AgentStream::Lifecycle {
                phase: LifecyclePhase::End,
                error: None,
            },
            Some("error") => AgentStream::Lifecycle {
                phase: LifecyclePhase::Error,
                error: raw.data.get("error").map(|e| match e {
                    Value::String(s) => s.clone(),
                    other => other
                        .get("message")
                        .and_then(Value::as_str)
                        .map_or_else(|| other.to_string(), str::to_string),
                }),
            },
            Some(other) => AgentStream::Other(format!("lifecycle:{other}")),
            None => {
                return Err(BridgeError::Protocol(
                    "lifecycle event without phase".to_string(),
                ))
            }
        },
        other => AgentStream::Other(other.to_string()),
    };

    Ok(AgentEvent {
        run_id: raw.run_id,
        session_key: raw.session_key,
        stream,
    })
}

/// Text of a `notification` payload: `text`, then `message`, then the JSON itself
fn notification_text(payload: &Value) -> String {
    payload
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| payload.get("message").and_then(Value::as_str))
        .map_or_else(|| payload.to_string(), str::to_string)
}
