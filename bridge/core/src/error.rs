//! Error types shared across the bridge
//!
//! Every fallible bridge operation reports a [`BridgeError`]. Framing and
//! parsing failures never reach callers: the link logs and drops them.
//! Timeouts and upstream errors surface only to the caller that issued the
//! request.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the bridge core
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BridgeError {
    /// The gateway link is not in the `Connected` state
    #[error("Gateway connection error: {0}")]
    Connection(String),

    /// A frame could not be understood
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No response arrived before the request expired
    #[error("Request '{method}' timed out after {timeout:?}")]
    RequestTimeout {
        /// Gateway method that was called
        method: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The gateway answered with an error
    #[error("Gateway error {code}: {message}")]
    Upstream {
        /// Error code reported by the gateway
        code: String,
        /// Human readable message reported by the gateway
        message: String,
    },

    /// A push notification could not be delivered
    #[error("Push delivery failed ({status:?}): {message}")]
    DeliveryFailure {
        /// HTTP status, when the endpoint answered at all
        status: Option<u16>,
        /// Failure description
        message: String,
    },

    /// The bridge is shutting down
    #[error("Bridge is shutting down")]
    ShuttingDown,

    /// The source exceeded its request budget
    #[error("Rate limit exceeded, retry in {retry_after:?}")]
    RateLimited {
        /// Time until the current window resets
        retry_after: Duration,
    },

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Short message suitable for showing to an end user
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Connection(_) => "The assistant is not reachable right now.".to_string(),
            Self::RequestTimeout { .. } => "The assistant took too long to answer.".to_string(),
            Self::Upstream { message, .. } => message.clone(),
            Self::RateLimited { retry_after } => match retry_after.as_secs().max(1) {
                1 => "Too many requests, try again in 1 second.".to_string(),
                secs => format!("Too many requests, try again in {secs} seconds."),
            },
            Self::ShuttingDown => "The bridge is shutting down.".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the error was caused by the link being down
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convenience alias for bridge results
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_message_rounds_up_to_one_second() {
        let err = BridgeError::RateLimited {
            retry_after: Duration::from_millis(200),
        };
        assert_eq!(
            err.user_message(),
            "Too many requests, try again in 1 second."
        );

        let err = BridgeError::RateLimited {
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(
            err.user_message(),
            "Too many requests, try again in 42 seconds."
        );
    }

    #[test]
    fn test_upstream_message_passes_through() {
        let err = BridgeError::Upstream {
            code: "INVALID".to_string(),
            message: "unknown session".to_string(),
        };
        assert_eq!(err.user_message(), "unknown session");
        assert_eq!(err.to_string(), "Gateway error INVALID: unknown session");
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: BridgeError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, BridgeError::Serialization(_)));
    }
}
