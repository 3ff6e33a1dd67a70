//! Connect handshake parameters

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway protocol version spoken by the bridge
pub const PROTOCOL_VERSION: u32 = 3;

const ROLE_OPERATOR: &str = "operator";
const SCOPE_READ: &str = "operator.read";
const SCOPE_WRITE: &str = "operator.write";

/// How the bridge identifies itself to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client id
    pub id: String,
    /// Client version
    pub version: String,
    /// Host platform
    pub platform: String,
    /// Client mode
    pub mode: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            id: "voice-bridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: "backend".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ConnectAuth {
    token: String,
}

/// Parameters of the `connect` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Lowest protocol version accepted
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    /// Highest protocol version accepted
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    /// Client identity
    pub client: ClientInfo,
    /// Requested role
    pub role: String,
    /// Requested scopes
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<ConnectAuth>,
    /// Challenge nonce being answered
    pub nonce: String,
}

impl ConnectParams {
    /// Answer to a challenge carrying `nonce`
    #[must_use]
    pub fn new(client: ClientInfo, token: Option<&str>, nonce: impl Into<String>) -> Self {
        Self {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client,
            role: ROLE_OPERATOR.to_string(),
            scopes: vec![SCOPE_READ.to_string(), SCOPE_WRITE.to_string()],
            auth: token
                .filter(|t| !t.is_empty())
                .map(|t| ConnectAuth { token: t.to_string() }),
            nonce: nonce.into(),
        }
    }

    /// Params as a JSON value
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Protocol version announced by a `hello-ok` payload, if it is one
pub(crate) fn hello_protocol(payload: &Value) -> Option<u64> {
    (payload.get("type").and_then(Value::as_str) == Some("hello-ok"))
        .then(|| payload.get("protocol").and_then(Value::as_u64))
        .flatten()
}
