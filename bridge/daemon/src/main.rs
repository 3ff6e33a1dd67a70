//! Bridge Daemon - Gateway bridge for realtime voice clients
//!
//! Keeps the agent gateway link open and serves browser voice clients over
//! WebSocket. Clients register a session, submit tasks, and receive results
//! and notifications, including those produced while they were away.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (config from $XDG_CONFIG_HOME/voice-bridge/bridge.toml)
//! bridge-daemon
//!
//! # Custom listen address and gateway
//! bridge-daemon --listen 0.0.0.0:8765 --gateway-url ws://gateway.lan:18789
//!
//! # With config file
//! bridge-daemon --config /etc/voice-bridge/bridge.toml
//!
//! # Verbose logging
//! RUST_LOG=debug bridge-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

use bridge_core::{load_config, load_config_from_path, Bridge, ConfigOverrides};
use server::DaemonServer;

/// Bridge Daemon - Gateway bridge for realtime voice clients
#[derive(Parser, Debug)]
#[command(name = "bridge-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to accept client WebSocket connections on
    #[arg(short = 'L', long, value_name = "ADDR")]
    listen: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "BRIDGE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Agent gateway WebSocket URL
    #[arg(short = 'g', long, value_name = "URL")]
    gateway_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "BRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            listen_addr: self.listen.clone(),
            gateway_url: self.gateway_url.clone(),
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("bridge_daemon={level},bridge_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "Bridge daemon starting"
    );

    let mut config = match &args.config {
        Some(path) => load_config_from_path(Some(path.clone())),
        None => load_config(),
    }
    .context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = ?config.source(),
        gateway = %config.gateway.url,
        listen = %config.server.listen_addr,
        session_key = %config.gateway.session_key,
        "Configuration loaded"
    );

    // Setup signal handlers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown_tx.send_replace(true);
    });

    let bridge = Bridge::new(&config).context("Failed to build bridge")?;
    bridge.start();

    let server = DaemonServer::new(bridge.clone(), config.server.clone());
    let result = server.run(shutdown_rx).await;

    info!(stats = ?bridge.stats(), "Shutting down...");
    bridge.shutdown();

    match result {
        Ok(()) => {
            info!("Bridge daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
