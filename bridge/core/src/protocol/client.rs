//! Client-facing messages
//!
//! Frames exchanged with the browser voice client over its WebSocket. Both
//! directions are internally tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::delivery::push::PushSubscription;

/// Messages sent by a client to the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to a logical session
    Register {
        /// Logical session id chosen by the client
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Shared secret, required when the bridge is configured with one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Voice-triggered task to hand to the agent
    Task {
        /// Transcribed request
        text: String,
    },
    /// Reset the agent conversation
    Reset,
    /// Register a push endpoint for this session
    PushSubscribe {
        /// Endpoint and client keys
        subscription: PushSubscription,
    },
    /// Remove this session's push endpoint
    PushUnsubscribe,
}

impl ClientMessage {
    /// Parse a client text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Messages sent by the bridge to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Final outcome of a task
    Result {
        /// Local task id returned when the task was accepted
        #[serde(rename = "taskId")]
        task_id: String,
        /// Final text, or a readable failure message
        text: String,
        /// Set when the task failed
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        error: bool,
    },
    /// Gateway notification fanned out to every session
    Notification {
        /// Notification text
        text: String,
        /// RFC 3339 timestamp
        timestamp: String,
    },
    /// Registration acknowledged
    Registered {
        /// Session id now bound to the connection
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Number of buffered results flushed on registration
        drained: usize,
    },
    /// Client protocol error
    Error {
        /// What went wrong
        message: String,
    },
}

impl BridgeMessage {
    /// Successful task result
    pub fn result(task_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Result {
            task_id: task_id.into(),
            text: text.into(),
            error: false,
        }
    }

    /// Failed task result
    pub fn failed_result(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Result {
            task_id: task_id.into(),
            text: message.into(),
            error: true,
        }
    }

    /// Notification stamped with the current time
    pub fn notification(text: impl Into<String>) -> Self {
        Self::Notification {
            text: text.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Short text preview used in push payloads
    #[must_use]
    pub fn preview(&self) -> Option<&str> {
        match self {
            Self::Result { text, .. } | Self::Notification { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
