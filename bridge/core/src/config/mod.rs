//! TOML Configuration File Support
//!
//! Centralized configuration loading for the bridge, supporting a TOML file
//! at `~/.config/voice-bridge/bridge.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (`BRIDGE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [gateway]
//! url = "ws://127.0.0.1:18789"
//! token = "gateway-secret"
//! session_key = "main"
//! request_timeout_ms = 60000
//! reconnect_delay_ms = 3000
//! reconnect_max_delay_ms = 60000
//!
//! [rate_limit]
//! max_requests = 30
//! window_secs = 60
//!
//! [delivery]
//! buffer_capacity = 50
//! push_endpoint = "https://push-relay.internal/send"
//!
//! [server]
//! listen_addr = "127.0.0.1:8765"
//! client_token = "client-secret"
//! max_connections = 100
//! session_idle_ttl_secs = 86400
//! ```
//!
//! Push fallback is off unless `push_endpoint` names a relay that performs
//! Web Push encryption. Setting `push_enabled = true` without a relay posts
//! plain JSON straight to each subscription endpoint, which only suits
//! endpoints that accept it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delivery::DEFAULT_BUFFER_CAPACITY;
use crate::rate_limit::RateLimitConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[gateway]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Gateway WebSocket URL
    pub url: Option<String>,
    /// Gateway auth token
    pub token: Option<String>,
    /// Gateway session key used for chat requests
    pub session_key: Option<String>,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: Option<u64>,
    /// Transport open and handshake timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// First reconnect delay in milliseconds
    pub reconnect_delay_ms: Option<u64>,
    /// Reconnect delay cap in milliseconds
    pub reconnect_max_delay_ms: Option<u64>,
}

/// `[rate_limit]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitToml {
    /// Requests per window per source
    pub max_requests: Option<u32>,
    /// Window length in seconds
    pub window_secs: Option<u64>,
    /// Sweep interval in seconds
    pub sweep_interval_secs: Option<u64>,
    /// Whether limiting is enabled
    pub enabled: Option<bool>,
}

/// `[delivery]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryToml {
    /// Buffered results kept per offline session
    pub buffer_capacity: Option<usize>,
    /// Push relay URL
    pub push_endpoint: Option<String>,
    /// Whether push fallback is enabled; defaults to on when a relay is set
    pub push_enabled: Option<bool>,
    /// Push request timeout in milliseconds
    pub push_timeout_ms: Option<u64>,
}

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Client-facing listen address
    pub listen_addr: Option<String>,
    /// Shared secret clients must present
    pub client_token: Option<String>,
    /// Maximum concurrent client connections
    pub max_connections: Option<usize>,
    /// Outbound queue length per client
    pub client_channel_capacity: Option<usize>,
    /// Disconnected-session cleanup interval in seconds
    pub cleanup_interval_secs: Option<u64>,
    /// Seconds a session may stay disconnected before it is forgotten
    pub session_idle_ttl_secs: Option<u64>,
}

/// Root of the TOML configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeToml {
    /// Gateway settings
    pub gateway: GatewayToml,
    /// Rate limit settings
    pub rate_limit: RateLimitToml,
    /// Delivery settings
    pub delivery: DeliveryToml,
    /// Client server settings
    pub server: ServerToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Gateway link settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Gateway WebSocket URL
    pub url: String,
    /// Gateway auth token
    pub token: Option<String>,
    /// Gateway session key
    pub session_key: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Transport open and handshake timeout
    pub connect_timeout: Duration,
    /// First reconnect delay
    pub reconnect_delay: Duration,
    /// Reconnect delay cap
    pub reconnect_max_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: None,
            session_key: "main".to_string(),
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
            reconnect_max_delay: Duration::from_secs(60),
        }
    }
}

/// Delivery settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Buffered results kept per offline session
    pub buffer_capacity: usize,
    /// Push relay URL; without one pushes go to subscription endpoints
    pub push_endpoint: Option<String>,
    /// Whether push fallback is enabled
    ///
    /// Off by default. Without `push_endpoint`, payloads are posted as
    /// plain JSON to subscription endpoints, which Web Push services reject.
    pub push_enabled: bool,
    /// Push request timeout
    pub push_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            push_endpoint: None,
            push_enabled: false,
            push_timeout: Duration::from_secs(10),
        }
    }
}

/// Client-facing server settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: String,
    /// Shared secret clients must present in `register`
    pub client_token: Option<String>,
    /// Maximum concurrent client connections
    pub max_connections: usize,
    /// Outbound queue length per client
    pub client_channel_capacity: usize,
    /// Disconnected-session cleanup interval
    pub cleanup_interval: Duration,
    /// How long a disconnected session and its buffered results are kept
    pub session_idle_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8765".to_string(),
            client_token: None,
            max_connections: 100,
            client_channel_capacity: 256,
            cleanup_interval: Duration::from_secs(30),
            session_idle_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Complete bridge configuration
///
/// Loaded from TOML, environment and CLI with [`load_config`].
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Gateway link settings
    pub gateway: GatewayConfig,

    /// Rate limit settings
    pub rate_limit: RateLimitConfig,

    /// Delivery settings
    pub delivery: DeliveryConfig,

    /// Client server settings
    pub server: ServerConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            rate_limit: RateLimitConfig::default(),
            delivery: DeliveryConfig::default(),
            server: ServerConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check values that would make the bridge unusable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "gateway.url must not be empty".to_string(),
            ));
        }
        if self.delivery.buffer_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "delivery.buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window.is_zero() {
            return Err(ConfigError::ValidationError(
                "rate_limit.window_secs must be at least 1".to_string(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_connections must be at least 1".to_string(),
            ));
        }
        if self.server.client_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "server.client_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.gateway.reconnect_max_delay < self.gateway.reconnect_delay {
            return Err(ConfigError::ValidationError(format!(
                "gateway.reconnect_max_delay_ms ({:?}) is below reconnect_delay_ms ({:?})",
                self.gateway.reconnect_max_delay, self.gateway.reconnect_delay
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/voice-bridge/bridge.toml` or
/// `~/.config/voice-bridge/bridge.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("voice-bridge").join("bridge.toml"))
}

/// Load configuration from all sources with proper priority
///
/// CLI overrides are not handled here; apply [`ConfigOverrides`] afterwards.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BridgeConfig, ConfigError> {
    let mut config = BridgeConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content = read_config_file(config_path)?;
            let toml_config: BridgeToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |name| std::env::var(name).ok());

    Ok(config)
}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut BridgeConfig, toml: &BridgeToml) {
    // Gateway settings
    if let Some(url) = &toml.gateway.url {
        config.gateway.url.clone_from(url);
    }
    if toml.gateway.token.is_some() {
        config.gateway.token.clone_from(&toml.gateway.token);
    }
    if let Some(key) = &toml.gateway.session_key {
        config.gateway.session_key.clone_from(key);
    }
    if let Some(ms) = toml.gateway.request_timeout_ms {
        config.gateway.request_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.gateway.connect_timeout_ms {
        config.gateway.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.gateway.reconnect_delay_ms {
        config.gateway.reconnect_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.gateway.reconnect_max_delay_ms {
        config.gateway.reconnect_max_delay = Duration::from_millis(ms);
    }

    // Rate limit settings
    if let Some(max) = toml.rate_limit.max_requests {
        config.rate_limit.max_requests = max;
    }
    if let Some(secs) = toml.rate_limit.window_secs {
        config.rate_limit.window = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.rate_limit.sweep_interval_secs {
        config.rate_limit.sweep_interval = Duration::from_secs(secs);
    }
    if let Some(enabled) = toml.rate_limit.enabled {
        config.rate_limit.enabled = enabled;
    }

    // Delivery settings
    if let Some(capacity) = toml.delivery.buffer_capacity {
        config.delivery.buffer_capacity = capacity;
    }
    if toml.delivery.push_endpoint.is_some() {
        config.delivery.push_endpoint.clone_from(&toml.delivery.push_endpoint);
        config.delivery.push_enabled = true;
    }
    if let Some(enabled) = toml.delivery.push_enabled {
        config.delivery.push_enabled = enabled;
    }
    if let Some(ms) = toml.delivery.push_timeout_ms {
        config.delivery.push_timeout = Duration::from_millis(ms);
    }

    // Server settings
    if let Some(addr) = &toml.server.listen_addr {
        config.server.listen_addr.clone_from(addr);
    }
    if toml.server.client_token.is_some() {
        config.server.client_token.clone_from(&toml.server.client_token);
    }
    if let Some(max) = toml.server.max_connections {
        config.server.max_connections = max;
    }
    if let Some(capacity) = toml.server.client_channel_capacity {
        config.server.client_channel_capacity = capacity;
    }
    if let Some(secs) = toml.server.cleanup_interval_secs {
        config.server.cleanup_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.server.session_idle_ttl_secs {
        config.server.session_idle_ttl = Duration::from_secs(secs);
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut BridgeConfig, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut from_env = false;
    let parsed = |name: &str| -> Option<u64> {
        let value = var(name)?;
        match value.trim().parse::<u64>() {
            Ok(n) => Some(n),
            Err(_) => {
                tracing::warn!(variable = name, value = %value, "Ignoring non-numeric value");
                None
            }
        }
    };

    if let Some(ms) = parsed("BRIDGE_REQUEST_TIMEOUT_MS") {
        config.gateway.request_timeout = Duration::from_millis(ms);
        from_env = true;
    }
    if let Some(ms) = parsed("BRIDGE_RECONNECT_DELAY_MS") {
        config.gateway.reconnect_delay = Duration::from_millis(ms);
        from_env = true;
    }
    if let Some(max) = parsed("BRIDGE_RATE_LIMIT_MAX") {
        config.rate_limit.max_requests = u32::try_from(max).unwrap_or(u32::MAX);
        from_env = true;
    }
    if let Some(secs) = parsed("BRIDGE_RATE_LIMIT_WINDOW_SECS") {
        config.rate_limit.window = Duration::from_secs(secs);
        from_env = true;
    }
    if let Some(capacity) = parsed("BRIDGE_BUFFER_CAPACITY") {
        config.delivery.buffer_capacity = usize::try_from(capacity).unwrap_or(usize::MAX);
        from_env = true;
    }

    if let Some(url) = var("BRIDGE_GATEWAY_URL") {
        config.gateway.url = url;
        from_env = true;
    }
    if let Some(token) = var("BRIDGE_GATEWAY_TOKEN") {
        config.gateway.token = Some(token);
        from_env = true;
    }
    if let Some(key) = var("BRIDGE_SESSION_KEY") {
        config.gateway.session_key = key;
        from_env = true;
    }
    if let Some(endpoint) = var("BRIDGE_PUSH_ENDPOINT") {
        config.delivery.push_endpoint = Some(endpoint);
        config.delivery.push_enabled = true;
        from_env = true;
    }
    if let Some(addr) = var("BRIDGE_LISTEN_ADDR") {
        config.server.listen_addr = addr;
        from_env = true;
    }
    if let Some(token) = var("BRIDGE_CLIENT_TOKEN") {
        config.server.client_token = Some(token);
        from_env = true;
    }

    if from_env {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub listen_addr: Option<String>,

    /// Gateway URL override
    pub gateway_url: Option<String>,
}

impl ConfigOverrides {
    /// Create empty overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the listen address
    #[must_use]
    pub fn with_listen_addr(mut self, addr: String) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Override the gateway URL
    #[must_use]
    pub fn with_gateway_url(mut self, url: String) -> Self {
        self.gateway_url = Some(url);
        self
    }

    /// Check if any overrides are set
    #[must_use]
    pub fn has_overrides(&self) -> bool {
        self.listen_addr.is_some() || self.gateway_url.is_some()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut BridgeConfig) {
        if let Some(addr) = &self.listen_addr {
            config.server.listen_addr.clone_from(addr);
        }
        if let Some(url) = &self.gateway_url {
            config.gateway.url.clone_from(url);
        }
        if self.has_overrides() {
            config.source = ConfigSource::Cli;
        }
    }
}
