//! The peer-side agent: one signaling channel, one connectivity manager,
//! one transfer coordinator and an output sink, wired together.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peerdrop_shared::protocol::{JoinPayload, RoomCodePayload};
use peerdrop_shared::{Envelope, MessageType, PeerInfo};

use crate::config::ClientConfig;
use crate::error::{SignalingError, TransferError};
use crate::events::EventBus;
use crate::reconnect::LinkState;
use crate::rtc::webrtc_backend::WebRtcFactory;
use crate::rtc::{PeerConnectionFactory, RtcManager};
use crate::signaling::{Connector, SignalEvent, SignalingChannel, WsConnector};
use crate::sink::{DirectorySink, OutputSink};
use crate::transfer::{OutgoingFile, TransferCoordinator, TransferEvent, TransferInfo};

/// Everything an agent reports, merged into one stream.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Connected,
    Disconnected,
    /// The visible peer list changed
    Peers(Vec<PeerInfo>),
    RoomCreated(String),
    RoomJoined(String),
    RoomLeft(String),
    RoomError(String),
    Transfer(TransferEvent),
}

/// Peers visible through the auto-scope room and the coded room.
///
/// A peer present in both rooms is announced (and later removed) once per
/// room, so entries are reference counted.
#[derive(Debug, Default)]
struct PeerBook {
    peers: BTreeMap<String, (PeerInfo, usize)>,
    /// Peers listed in the `room-joined` for the current coded room
    coded: HashSet<String>,
    room: Option<String>,
}

impl PeerBook {
    fn add(&mut self, peer: PeerInfo) {
        let entry = self.peers.entry(peer.id.clone()).or_insert_with(|| (peer.clone(), 0));
        entry.0 = peer;
        entry.1 += 1;
    }

    fn remove(&mut self, id: &str) {
        if let Some(entry) = self.peers.get_mut(id) {
            entry.1 -= 1;
            if entry.1 == 0 {
                self.peers.remove(id);
            }
        }
    }

    fn clear(&mut self) {
        self.peers.clear();
        self.coded.clear();
    }

    fn list(&self) -> Vec<PeerInfo> {
        self.peers.values().map(|(info, _)| info.clone()).collect()
    }

    /// Apply a signaling event. Returns whether the peer list changed.
    fn apply(&mut self, event: &SignalEvent) -> bool {
        match event {
            SignalEvent::Connected | SignalEvent::Disconnected => {
                let had = !self.peers.is_empty();
                self.clear();
                had
            }
            SignalEvent::Peers(peers) => {
                for peer in peers {
                    self.add(peer.clone());
                }
                !peers.is_empty()
            }
            SignalEvent::PeerJoined(peer) => {
                self.add(peer.clone());
                true
            }
            SignalEvent::PeerLeft(id) => {
                self.coded.remove(id);
                self.remove(id);
                true
            }
            SignalEvent::RoomCreated(code) => {
                self.leave_coded();
                self.room = Some(code.clone());
                true
            }
            SignalEvent::RoomJoined { code, peers } => {
                if self.room.as_deref() != Some(code) {
                    self.leave_coded();
                }
                self.room = Some(code.clone());
                for peer in peers {
                    if self.coded.insert(peer.id.clone()) {
                        self.add(peer.clone());
                    }
                }
                true
            }
            SignalEvent::RoomLeft(_) => {
                self.leave_coded();
                self.room = None;
                true
            }
            _ => false,
        }
    }

    /// Drop the coded room's contribution. Peers that joined the coded room
    /// after us can't be told apart from auto-scope arrivals and stay.
    fn leave_coded(&mut self) {
        for id in std::mem::take(&mut self.coded) {
            self.remove(&id);
        }
    }
}

struct Shared {
    signaling: SignalingChannel,
    rtc: RtcManager,
    transfers: TransferCoordinator,
    book: Mutex<PeerBook>,
    events: EventBus<AgentEvent>,
    auto_accept: bool,
}

impl Shared {
    fn snapshot(&self) -> Vec<PeerInfo> {
        self.book.lock().map(|b| b.list()).unwrap_or_default()
    }

    fn on_signal(&self, event: SignalEvent) {
        let (changed, rejoin) = match self.book.lock() {
            Ok(mut book) => {
                let changed = book.apply(&event);
                let rejoin = matches!(event, SignalEvent::Connected)
                    .then(|| book.room.clone())
                    .flatten();
                (changed, rejoin)
            }
            Err(_) => (false, None),
        };

        match event {
            SignalEvent::Connected => {
                info!("Connected to signaling server");
                self.events.publish(AgentEvent::Connected);
                if let Some(code) = rejoin {
                    info!(room = %code, "Rejoining room after reconnect");
                    if let Err(e) = send_join_room(&self.signaling, &code) {
                        warn!(room = %code, error = %e, "Failed to rejoin room");
                    }
                }
            }
            SignalEvent::Disconnected => {
                info!("Disconnected from signaling server");
                self.events.publish(AgentEvent::Disconnected);
            }
            SignalEvent::RoomCreated(code) => {
                info!(room = %code, "Room created");
                self.events.publish(AgentEvent::RoomCreated(code));
            }
            SignalEvent::RoomJoined { code, peers } => {
                info!(room = %code, peers = peers.len(), "Joined room");
                self.events.publish(AgentEvent::RoomJoined(code));
            }
            SignalEvent::RoomLeft(code) => {
                info!(room = %code, "Left room");
                self.events.publish(AgentEvent::RoomLeft(code));
            }
            SignalEvent::RoomError(error) => {
                warn!(%error, "Room error");
                self.events.publish(AgentEvent::RoomError(error));
            }
            _ => {}
        }

        if changed {
            self.events.publish(AgentEvent::Peers(self.snapshot()));
        }
    }

    async fn on_transfer(&self, event: TransferEvent) {
        if let TransferEvent::Requested(info) = &event {
            if self.auto_accept {
                debug!(transfer = %info.id, "Auto-accepting");
                // Publish first so subscribers see the request before its outcome
                self.events.publish(AgentEvent::Transfer(event.clone()));
                if let Err(e) = self.transfers.accept(&info.id).await {
                    warn!(transfer = %info.id, error = %e, "Auto-accept failed");
                }
                return;
            }
        }
        self.events.publish(AgentEvent::Transfer(event));
    }
}

fn send_join_room(signaling: &SignalingChannel, code: &str) -> Result<(), SignalingError> {
    let env = Envelope::with_payload(
        MessageType::JoinRoom,
        &RoomCodePayload {
            code: code.to_string(),
        },
    )?;
    signaling.send(env)
}

/// Room codes are matched case-insensitively and ignore surrounding space.
pub fn normalize_room_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// A running peer agent.
pub struct Agent {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Agent {
    /// Connect to the configured signaling server over WebSocket, negotiate
    /// real WebRTC channels and write received files to the download
    /// directory.
    pub fn connect(config: &ClientConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.signaling_url.clone()));
        let factory = Arc::new(WebRtcFactory::new(config.stun_servers.clone()));
        let sink = Arc::new(DirectorySink::new(config.download_dir.clone()));
        Self::start(config, connector, factory, sink)
    }

    /// Build an agent from explicit collaborators.
    pub fn start(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        factory: Arc<dyn PeerConnectionFactory>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let identity = JoinPayload {
            name: config.device_name.clone(),
            platform: config.platform.clone(),
        };
        let signaling = SignalingChannel::spawn(connector, identity, config.signaling.clone());
        let rtc = RtcManager::spawn(factory, signaling.clone());
        let transfers = TransferCoordinator::spawn(signaling.clone(), rtc.clone(), sink, config.transfer.clone());

        let mut signals = signaling.subscribe();
        let mut transfer_events = transfers.subscribe();

        let shared = Arc::new(Shared {
            signaling,
            rtc,
            transfers,
            book: Mutex::new(PeerBook::default()),
            events: EventBus::new(),
            auto_accept: config.auto_accept,
        });

        let this = shared.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = signals.recv() => match signal {
                        Some(event) => this.on_signal(event),
                        None => break,
                    },
                    event = transfer_events.recv() => match event {
                        Some(event) => this.on_transfer(event).await,
                        None => break,
                    },
                }
            }
            debug!("Agent event loop stopped");
        });

        info!(name = %config.device_name, url = %config.signaling_url, "Agent started");
        Self { shared, task }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        self.shared.events.subscribe()
    }

    pub fn link_state(&self) -> LinkState {
        self.shared.signaling.state()
    }

    /// Visible peers, unique by id.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.snapshot()
    }

    /// Code of the coded room we're in, if any.
    pub fn room(&self) -> Option<String> {
        self.shared.book.lock().ok().and_then(|b| b.room.clone())
    }

    pub fn create_room(&self) -> Result<(), SignalingError> {
        self.shared.signaling.send(Envelope::new(MessageType::CreateRoom))
    }

    pub fn join_room(&self, code: &str) -> Result<(), SignalingError> {
        let code = normalize_room_code(code);
        if code.is_empty() {
            return Err(SignalingError::InvalidRoomCode(code));
        }
        send_join_room(&self.shared.signaling, &code)
    }

    pub fn leave_room(&self) -> Result<(), SignalingError> {
        self.shared.signaling.send(Envelope::new(MessageType::LeaveRoom))
    }

    pub async fn send_files(&self, peer: &str, files: Vec<OutgoingFile>) -> Result<String, TransferError> {
        self.shared.transfers.send_files(peer, files).await
    }

    /// Read `paths` from disk and offer them to `peer`.
    pub async fn send_paths(&self, peer: &str, paths: &[PathBuf]) -> Result<String, TransferError> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(OutgoingFile::from_path(path).await?);
        }
        self.send_files(peer, files).await
    }

    pub async fn accept(&self, transfer_id: &str) -> Result<(), TransferError> {
        self.shared.transfers.accept(transfer_id).await
    }

    pub async fn reject(&self, transfer_id: &str) -> Result<(), TransferError> {
        self.shared.transfers.reject(transfer_id).await
    }

    pub async fn cancel(&self, transfer_id: &str) -> Result<(), TransferError> {
        self.shared.transfers.cancel(transfer_id).await
    }

    pub async fn transfers(&self) -> Vec<TransferInfo> {
        self.shared.transfers.transfers().await
    }

    /// Close every connectivity session and the signaling link, and stop
    /// every background task the agent started.
    pub async fn shutdown(self) {
        self.task.abort();
        self.shared.transfers.stop().await;
        for peer in self.shared.snapshot() {
            self.shared.rtc.close(&peer.id).await;
        }
        self.shared.rtc.stop();
        self.shared.signaling.stop();
        info!("Agent stopped");
    }
}
