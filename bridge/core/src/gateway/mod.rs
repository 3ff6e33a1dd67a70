//! Upstream gateway connection
//!
//! [`GatewayLink`] owns the single WebSocket to the gateway: it opens it,
//! answers the `connect.challenge`, and reconnects with backoff whenever the
//! transport drops. Everything above the link talks to it through two small
//! seams:
//!
//! - [`FrameSink`]: what the correlator needs to send a request
//! - [`FrameHandler`]: what the link calls for every parsed inbound frame
//!
//! # State machine
//!
//! ```text
//!   Disconnected ──connect/timer──▶ Connecting ──open──▶ AwaitingChallenge
//!        ▲                                                     │
//!        │                                          challenge  │ send connect
//!        │                                                     ▼
//!        └──────── close / error / rejection ────────  Connected (hello-ok)
//! ```

mod backoff;
mod handshake;
mod link;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{InboundFrame, OutboundRequest};

pub use backoff::Backoff;
pub use handshake::{ClientInfo, ConnectParams, PROTOCOL_VERSION};
pub use link::{GatewayLink, LinkConfig, LinkMetrics};

/// Connection state of the gateway link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No transport
    Disconnected,
    /// Transport being opened
    Connecting,
    /// Transport open, waiting for the gateway's challenge
    AwaitingChallenge,
    /// Handshake complete
    Connected,
}

impl LinkState {
    /// Whether a connection attempt is underway or complete
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingChallenge => "awaiting_challenge",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Sends request frames to the gateway
pub trait FrameSink: Send + Sync {
    /// Queue `frame` for transmission
    ///
    /// Fails with [`BridgeError::Connection`](crate::BridgeError::Connection)
    /// when the link is not connected.
    fn send_frame(&self, frame: &OutboundRequest) -> Result<()>;

    /// Whether frames can currently be sent
    fn is_connected(&self) -> bool;
}

/// Receives inbound frames in arrival order
///
/// Called inline on the link's reader task, so implementations must not
/// block.
pub trait FrameHandler: Send + Sync {
    /// Handle one frame
    fn handle_frame(&self, frame: InboundFrame);
}
