//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to session adapters.
//! It provides the router construction and server startup functionality.

use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::bootstrap::BootstrappedServices;

pub mod http;
pub mod ws;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),

    /// No available ports in the specified range.
    #[error("no available ports in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },
}

/// Shared application state for the API layer.
///
/// A thin wrapper around the composition root: handlers reach session
/// adapters through `services` and never hold adapter state directly.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<BootstrappedServices>,
}

impl AppState {
    pub fn new(services: BootstrappedServices) -> Self {
        Self { services: Arc::new(services) }
    }
}

async fn find_available_port(start: u16, end: u16) -> Result<(u16, TcpListener), ServerError> {
    for port in start..=end {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        match TcpListener::bind(&addr).await {
            Ok(listener) => return Ok((port, listener)),
            Err(_) => continue,
        }
    }
    Err(ServerError::NoAvailablePort { start, end })
}

/// Starts the HTTP/WebSocket server on `preferred_port`, or the first free
/// port in `49400..=49410` when `preferred_port` is `0`.
pub async fn start_server(state: AppState, preferred_port: u16) -> Result<(), ServerError> {
    let (port, listener) = if preferred_port > 0 {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], preferred_port));
        (preferred_port, TcpListener::bind(&addr).await?)
    } else {
        find_available_port(49400, 49410).await?
    };

    log::info!("[Server] listening on http://0.0.0.0:{port}");
    let app = http::create_router(state);
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
