//! # peerdrop-server
//!
//! Signaling hub for PeerDrop local-network file sharing.
//!
//! This binary provides:
//! - **Auto-scope rooms** grouping devices that share a network prefix
//! - **Coded rooms** joined with a short human-shareable code
//! - **Directed relay** of WebRTC negotiation, transfer handshakes and
//!   relay-path file chunks between sessions in a shared room
//! - **REST API** (axum) for health checks, hub statistics and discovered peers

mod api;
mod config;
mod directory;
mod error;
mod hub;
mod room;
mod session;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::directory::EmptyDirectory;
use crate::hub::Hub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,peerdrop_server=debug")),
        )
        .init();

    info!("Starting PeerDrop signaling server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let hub = Hub::new(config.send_queue_capacity);

    // Discovery runs outside this process; nothing feeds the directory here
    let directory = Arc::new(EmptyDirectory);

    let app_state = AppState {
        hub: hub.clone(),
        directory,
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic sweep of rooms left empty by paths that skipped cleanup
    let sweep_hub = hub.clone();
    let sweep_interval = config.room_sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            sweep_hub.sweep_empty_rooms().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP / WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = hub.stats().await;
            info!(sessions = stats.sessions, "Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
