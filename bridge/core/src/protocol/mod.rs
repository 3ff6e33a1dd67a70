//! Wire protocols
//!
//! - [`frames`]: JSON frames exchanged with the upstream gateway
//! - [`client`]: JSON frames exchanged with browser voice clients

pub mod client;
pub mod frames;

pub use client::{BridgeMessage, ClientMessage};
pub use frames::{
    AgentEvent, AgentStream, GatewayEvent, InboundFrame, LifecyclePhase, OutboundRequest,
    ResponseFrame, UpstreamError,
};
