//! # peerdrop-client
//!
//! Headless PeerDrop agent. Announces itself to the signaling server,
//! logs peers, rooms and transfers, and writes received files to the
//! download directory.
//!
//! Any paths given on the command line are offered to every peer as it
//! appears. Set `ROOM_CODE` to join a coded room once connected.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peerdrop_client::transfer::TransferEvent;
use peerdrop_client::{Agent, AgentEvent, ClientConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,peerdrop_client=debug")),
        )
        .init();

    info!("Starting PeerDrop agent v{}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    for path in &paths {
        if !path.is_file() {
            anyhow::bail!("not a file: {}", path.display());
        }
    }
    let room_code = std::env::var("ROOM_CODE").ok().filter(|c| !c.trim().is_empty());

    let agent = Agent::connect(&config);
    let mut events = agent.subscribe();

    let run = async {
        // Peers already offered the files
        let mut offered: HashSet<String> = HashSet::new();
        while let Some(event) = events.recv().await {
            match event {
                AgentEvent::Connected => {
                    if let Some(code) = &room_code {
                        if agent.room().is_none() {
                            if let Err(e) = agent.join_room(code) {
                                warn!(error = %e, "Could not join room");
                            }
                        }
                    }
                }
                AgentEvent::Disconnected => {}
                AgentEvent::Peers(peers) => {
                    info!(count = peers.len(), "Peers: {}", describe(&peers));
                    if paths.is_empty() {
                        continue;
                    }
                    for peer in peers {
                        if !offered.insert(peer.id.clone()) {
                            continue;
                        }
                        match agent.send_paths(&peer.id, &paths).await {
                            Ok(id) => info!(transfer = %id, peer = %peer.name, "Offered files"),
                            Err(e) => {
                                warn!(peer = %peer.name, error = %e, "Could not offer files");
                                offered.remove(&peer.id);
                            }
                        }
                    }
                }
                AgentEvent::RoomCreated(code) | AgentEvent::RoomJoined(code) => {
                    info!(room = %code, "In room");
                }
                AgentEvent::RoomLeft(code) => info!(room = %code, "Left room"),
                AgentEvent::RoomError(error) => warn!(%error, "Room error"),
                AgentEvent::Transfer(event) => log_transfer(&event),
            }
        }
    };

    tokio::select! {
        _ = run => warn!("Agent event stream ended"),
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
    }

    agent.shutdown().await;
    Ok(())
}

fn describe(peers: &[peerdrop_shared::PeerInfo]) -> String {
    peers
        .iter()
        .map(|p| format!("{} ({})", p.name, p.platform))
        .collect::<Vec<_>>()
        .join(", ")
}

fn log_transfer(event: &TransferEvent) {
    match event {
        TransferEvent::Requested(info) => info!(
            transfer = %info.id,
            peer = %info.peer,
            files = info.files.len(),
            bytes = info.total_size,
            "Incoming transfer request"
        ),
        TransferEvent::Progress { id, fraction, .. } => {
            tracing::debug!(transfer = %id, "{:.0}%", fraction * 100.0)
        }
        TransferEvent::FileReceived { id, name, size } => {
            info!(transfer = %id, file = %name, size, "Received file")
        }
        TransferEvent::Failed { id, reason } => warn!(transfer = %id, %reason, "Transfer failed"),
        other => info!(?other, "Transfer update"),
    }
}
