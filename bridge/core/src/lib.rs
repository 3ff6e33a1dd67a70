//! Bridge Core - Gateway bridge and session broadcast engine
//!
//! This crate keeps one long-lived WebSocket link to an agent gateway and
//! fans results out to many short-lived client sessions (voice front-ends,
//! browser tabs). It has no opinion on how clients connect; the daemon
//! crate supplies the listener.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          Client sessions                          │
//! │     ┌──────────┐      ┌──────────┐      ┌──────────────────┐      │
//! │     │  Phone   │      │ Browser  │      │ Offline (buffer) │      │
//! │     └────┬─────┘      └────┬─────┘      └────────┬─────────┘      │
//! │          └─────────────────┴─────────────────────┘                │
//! │                ClientMessage (up)  BridgeMessage (down)           │
//! └──────────────────────────────┬────────────────────────────────────┘
//!                                │
//! ┌──────────────────────────────┼────────────────────────────────────┐
//! │                         BRIDGE CORE                               │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌─────────┐  │
//! │  │ Sessions │ │ Delivery │ │   Runs   │ │Correlator│ │  Rate   │  │
//! │  │ Registry │ │ + Push   │ │ Tracker  │ │          │ │ Limiter │  │
//! │  └──────────┘ └──────────┘ └──────────┘ └────┬─────┘ └─────────┘  │
//! │                                        ┌─────┴──────┐             │
//! │                                        │GatewayLink │             │
//! │                                        └─────┬──────┘             │
//! └──────────────────────────────────────────────┼────────────────────┘
//!                                                │ WebSocket
//!                                         Agent gateway
//! ```
//!
//! # Key Types
//!
//! - [`Bridge`]: Owns every component and dispatches gateway frames
//! - [`GatewayLink`]: Connection, handshake and reconnect to the gateway
//! - [`RequestCorrelator`]: Matches gateway responses to callers
//! - [`RunTracker`]: Follows agent runs from request to final text
//! - [`SessionRegistry`]: Client sessions and their live transports
//! - [`Deliverer`]: Direct send, offline buffering, push fallback
//! - [`RateLimiter`]: Fixed-window admission per source
//!
//! # Module Overview
//!
//! - [`auth`]: Shared-secret check for client registration
//! - [`bridge`]: The orchestrator
//! - [`config`]: TOML and environment configuration
//! - [`correlator`]: Request/response correlation with timeouts
//! - [`delivery`]: Offline buffer and push notifications
//! - [`error`]: Error type shared by every module
//! - [`gateway`]: Gateway link state machine
//! - [`protocol`]: Gateway frames and client messages
//! - [`rate_limit`]: Fixed-window rate limiting
//! - [`runs`]: Run tracking and re-keying
//! - [`sessions`]: Session registry and broadcast

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod bridge;
pub mod config;
pub mod correlator;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod rate_limit;
pub mod runs;
pub mod sessions;

// Re-exports for convenience
pub use auth::{AuthError, SharedSecret};
pub use bridge::{Bridge, BridgeStats};
pub use correlator::{CorrelatorMetrics, RequestCorrelator};
pub use error::{BridgeError, Result};
pub use gateway::{FrameHandler, FrameSink, GatewayLink, LinkConfig, LinkState};
pub use protocol::{BridgeMessage, ClientMessage, InboundFrame, OutboundRequest};
pub use rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use runs::{RunTracker, TaskId};
pub use sessions::{
    BroadcastResult, ConnectionId, RegistrySummary, SessionHandle, SessionId, SessionRegistry,
};

// Delivery exports
pub use delivery::push::{PushNotifier, PushSubscription, WebhookPushNotifier};
pub use delivery::{Deliverer, DeliveryBuffer, DeliveryOutcome};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, BridgeConfig, BridgeToml,
    ConfigError, ConfigOverrides, ConfigSource,
};
