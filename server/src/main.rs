//! Mediaplane Server - standalone headless server hosting per-session media
//! control plane adapters.
//!
//! Bridges an SFU's published/pulled WebRTC tracks to an upstream AI
//! provider's streaming TTS/STT endpoints, over a plain HTTP/WebSocket API.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mediaplane_core::{bootstrap_services, start_server, AppState};

use crate::config::ServerConfig;

/// Headless media control plane server.
#[derive(Parser, Debug)]
#[command(name = "mediaplane-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "MEDIAPLANE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file). 0 selects the first free port.
    #[arg(short = 'p', long, env = "MEDIAPLANE_BIND_PORT")]
    port: Option<u16>,

    /// Directory for durable per-session state (overrides config file).
    #[arg(short = 'd', long, env = "MEDIAPLANE_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Mediaplane Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }

    let adapter_config = config.to_adapter_config();
    let services = bootstrap_services(adapter_config);
    log::info!("Services bootstrapped successfully");

    let app_state = AppState::new(services.clone());
    let bind_port = config.bind_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state, bind_port).await {
            log::error!("Server error: {}", e);
        }
    });

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
