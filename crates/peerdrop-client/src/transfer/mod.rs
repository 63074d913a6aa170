//! File transfer coordination.
//!
//! A transfer moves through `pending -> accepted -> transferring ->
//! completed`, or ends early as rejected, timed out, failed or cancelled.
//! Terminal transfers are dropped from the registry; only the event
//! stream records how they ended.
//!
//! Senders try a direct data channel first and fall back to relaying
//! base64 chunks through the hub when none opens in time. The path is
//! chosen once per transfer.

mod incoming;
mod outgoing;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use peerdrop_shared::protocol::{RelayChunkPayload, TransferRequestPayload, TransferResponsePayload};
use peerdrop_shared::types::total_size;
use peerdrop_shared::{Envelope, FileDescriptor, Frame, MessageType};

use crate::error::TransferError;
use crate::events::EventBus;
use crate::rtc::{DataChannel, RtcEvent, RtcManager};
use crate::signaling::{SignalEvent, SignalingChannel};
use crate::sink::{OutputSink, ReceivedFile};

pub use incoming::{AssembledFile, DirectReceiver, RelayReceiver};
pub use outgoing::OutgoingFile;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Pause direct sends while the channel buffers more than this
    pub high_water_mark: usize,
    pub backpressure_poll: Duration,
    pub relay_chunk_delay: Duration,
    /// How long to wait for a direct channel before relaying
    pub channel_timeout: Duration,
    /// How long to wait for the recipient to answer a request
    pub response_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Accepted,
    Transferring,
    Completed,
    Rejected,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    Direct,
    Relay,
}

/// Snapshot of a live transfer.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub id: String,
    pub peer: String,
    pub direction: Direction,
    pub files: Vec<FileDescriptor>,
    pub total_size: u64,
    pub state: TransferState,
    pub path: Option<DeliveryPath>,
    pub bytes: u64,
}

impl TransferInfo {
    /// Fraction of the aggregate size moved so far.
    pub fn progress(&self) -> f64 {
        fraction(self.bytes, self.total_size)
    }
}

fn fraction(bytes: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        bytes as f64 / total as f64
    }
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Incoming request waiting for accept or reject
    Requested(TransferInfo),
    Accepted { id: String },
    Rejected { id: String },
    /// No answer to our request in time
    TimedOut { id: String },
    Started { id: String, path: DeliveryPath },
    Progress { id: String, bytes: u64, total: u64, fraction: f64 },
    FileReceived { id: String, name: String, size: u64 },
    Completed { id: String },
    Failed { id: String, reason: String },
    Cancelled { id: String },
}

struct Outbound {
    info: TransferInfo,
    response: Option<oneshot::Sender<bool>>,
    cancel: Arc<AtomicBool>,
    bytes: Arc<AtomicU64>,
}

enum Reassembly {
    /// Accepted, no data seen yet
    Waiting,
    Direct(DirectReceiver),
    Relay(RelayReceiver),
}

struct Inbound {
    info: TransferInfo,
    reassembly: Reassembly,
}

#[derive(Default)]
struct Registry {
    outbound: HashMap<String, Outbound>,
    inbound: HashMap<String, Inbound>,
    /// Recently rejected inbound ids, oldest first
    rejected: VecDeque<String>,
}

/// How many rejected ids are remembered to catch a repeated decision.
const RECENT_REJECTS: usize = 64;

impl Registry {
    fn remember_reject(&mut self, id: &str) {
        if self.rejected.len() >= RECENT_REJECTS {
            self.rejected.pop_front();
        }
        self.rejected.push_back(id.to_string());
    }

    fn was_rejected(&self, id: &str) -> bool {
        self.rejected.iter().any(|r| r == id)
    }
}

/// How a transfer ended.
enum Outcome {
    Completed,
    Rejected,
    TimedOut,
    Cancelled,
    Failed(String),
}

impl Outcome {
    fn from_result(result: Result<(), TransferError>) -> Self {
        match result {
            Ok(()) => Outcome::Completed,
            Err(TransferError::Cancelled) => Outcome::Cancelled,
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    fn event(self, id: String) -> TransferEvent {
        match self {
            Outcome::Completed => TransferEvent::Completed { id },
            Outcome::Rejected => TransferEvent::Rejected { id },
            Outcome::TimedOut => TransferEvent::TimedOut { id },
            Outcome::Cancelled => TransferEvent::Cancelled { id },
            Outcome::Failed(reason) => TransferEvent::Failed { id, reason },
        }
    }
}

/// Work left to do after an inbound message updated the registry.
enum Followup {
    None,
    Deliver(Vec<AssembledFile>, bool),
    Fail(TransferError),
}

struct Inner {
    signaling: SignalingChannel,
    rtc: RtcManager,
    sink: Arc<dyn OutputSink>,
    config: TransferConfig,
    registry: Mutex<Registry>,
    events: EventBus<TransferEvent>,
    task: OnceLock<AbortHandle>,
}

#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<Inner>,
}

impl TransferCoordinator {
    pub fn spawn(
        signaling: SignalingChannel,
        rtc: RtcManager,
        sink: Arc<dyn OutputSink>,
        config: TransferConfig,
    ) -> Self {
        let mut signals = signaling.subscribe();
        let mut rtc_events = rtc.subscribe();

        let coordinator = Self {
            inner: Arc::new(Inner {
                signaling,
                rtc,
                sink,
                config,
                registry: Mutex::new(Registry::default()),
                events: EventBus::new(),
                task: OnceLock::new(),
            }),
        };

        let this = coordinator.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = signals.recv() => match signal {
                        Some(event) => this.handle_signal(event).await,
                        None => break,
                    },
                    event = rtc_events.recv() => match event {
                        Some(event) => this.handle_rtc(event).await,
                        None => break,
                    },
                }
            }
            debug!("Transfer coordinator stopped");
        });
        let _ = coordinator.inner.task.set(task.abort_handle());

        coordinator
    }

    /// Stop the event loop and cancel every outgoing transfer.
    pub async fn stop(&self) {
        if let Some(task) = self.inner.task.get() {
            task.abort();
        }
        let mut registry = self.inner.registry.lock().await;
        for outbound in registry.outbound.values_mut() {
            outbound.cancel.store(true, Ordering::SeqCst);
            outbound.response.take();
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of every live transfer.
    pub async fn transfers(&self) -> Vec<TransferInfo> {
        let registry = self.inner.registry.lock().await;
        let outbound = registry.outbound.values().map(|o| TransferInfo {
            bytes: o.bytes.load(Ordering::Relaxed),
            ..o.info.clone()
        });
        let inbound = registry.inbound.values().map(|i| i.info.clone());
        outbound.chain(inbound).collect()
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Offer `files` to `peer`. Returns the transfer id once the request is
    /// sent; the rest of the transfer runs in the background and reports
    /// through [`subscribe`](Self::subscribe).
    pub async fn send_files(&self, peer: &str, files: Vec<OutgoingFile>) -> Result<String, TransferError> {
        if files.is_empty() {
            return Err(TransferError::NoFiles);
        }
        if files.len() > usize::from(u16::MAX) + 1 {
            return Err(TransferError::TooManyFiles(files.len()));
        }

        let descriptors: Vec<FileDescriptor> = files.iter().map(OutgoingFile::descriptor).collect();
        let total = total_size(&descriptors);
        let id = uuid::Uuid::new_v4().to_string();
        let (response_tx, response_rx) = oneshot::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let bytes = Arc::new(AtomicU64::new(0));

        {
            let mut registry = self.inner.registry.lock().await;
            if registry.outbound.values().any(|o| o.info.peer == peer) {
                return Err(TransferError::Busy(peer.to_string()));
            }
            registry.outbound.insert(
                id.clone(),
                Outbound {
                    info: TransferInfo {
                        id: id.clone(),
                        peer: peer.to_string(),
                        direction: Direction::Outgoing,
                        files: descriptors.clone(),
                        total_size: total,
                        state: TransferState::Pending,
                        path: None,
                        bytes: 0,
                    },
                    response: Some(response_tx),
                    cancel: cancel.clone(),
                    bytes: bytes.clone(),
                },
            );
        }

        let request = TransferRequestPayload {
            transfer_id: id.clone(),
            files: descriptors,
            total_size: total,
        };
        let sent = Envelope::with_payload(MessageType::TransferRequest, &request)
            .map_err(TransferError::from)
            .and_then(|env| {
                self.inner
                    .signaling
                    .send(env.to(peer))
                    .map_err(TransferError::from)
            });
        if let Err(e) = sent {
            self.inner.registry.lock().await.outbound.remove(&id);
            return Err(e);
        }

        info!(transfer = %id, peer = %peer, files = files.len(), bytes = total, "Transfer requested");

        let this = self.clone();
        let transfer_id = id.clone();
        let peer = peer.to_string();
        tokio::spawn(async move {
            let outcome = this
                .run_outgoing(&transfer_id, &peer, &files, response_rx, &cancel, &bytes)
                .await;
            this.finish_outgoing(transfer_id, outcome).await;
        });

        Ok(id)
    }

    async fn run_outgoing(
        &self,
        id: &str,
        peer: &str,
        files: &[OutgoingFile],
        response: oneshot::Receiver<bool>,
        cancel: &AtomicBool,
        bytes: &Arc<AtomicU64>,
    ) -> Outcome {
        let config = &self.inner.config;
        match tokio::time::timeout(config.response_timeout, response).await {
            Err(_) => return Outcome::TimedOut,
            // Sender dropped by cancel()
            Ok(Err(_)) => return Outcome::Cancelled,
            Ok(Ok(false)) => return Outcome::Rejected,
            Ok(Ok(true)) => {}
        }

        self.set_outbound_state(id, TransferState::Accepted, None).await;
        self.inner.events.publish(TransferEvent::Accepted { id: id.to_string() });
        info!(transfer = %id, "Transfer accepted");

        let channel = self.obtain_channel(peer).await;
        if cancel.load(Ordering::SeqCst) {
            return Outcome::Cancelled;
        }

        let path = if channel.is_some() {
            DeliveryPath::Direct
        } else {
            DeliveryPath::Relay
        };
        self.set_outbound_state(id, TransferState::Transferring, Some(path)).await;
        self.inner.events.publish(TransferEvent::Started {
            id: id.to_string(),
            path,
        });
        info!(transfer = %id, ?path, "Sending");

        let total: u64 = files.iter().map(|f| f.data.len() as u64).sum();
        let events = &self.inner.events;
        let progress = |len: u64| {
            let sent = bytes.fetch_add(len, Ordering::Relaxed) + len;
            events.publish(TransferEvent::Progress {
                id: id.to_string(),
                bytes: sent,
                total,
                fraction: fraction(sent, total),
            });
        };

        let result = match channel {
            Some(channel) => outgoing::send_direct(channel.as_ref(), id, files, config, cancel, progress).await,
            None => {
                outgoing::send_relay(&self.inner.signaling, peer, id, files, config, cancel, progress).await
            }
        };
        Outcome::from_result(result)
    }

    async fn finish_outgoing(&self, id: String, outcome: Outcome) {
        self.inner.registry.lock().await.outbound.remove(&id);
        match &outcome {
            Outcome::Completed => info!(transfer = %id, "Transfer completed"),
            Outcome::Rejected => info!(transfer = %id, "Transfer rejected"),
            Outcome::TimedOut => warn!(transfer = %id, "No response to transfer request"),
            Outcome::Cancelled => info!(transfer = %id, "Transfer cancelled"),
            Outcome::Failed(reason) => warn!(transfer = %id, %reason, "Transfer failed"),
        }
        self.inner.events.publish(outcome.event(id));
    }

    async fn set_outbound_state(&self, id: &str, state: TransferState, path: Option<DeliveryPath>) {
        let mut registry = self.inner.registry.lock().await;
        if let Some(o) = registry.outbound.get_mut(id) {
            o.info.state = state;
            if path.is_some() {
                o.info.path = path;
            }
        }
    }

    /// Reuse an open channel, or negotiate one and wait a bounded time.
    /// `None` means relay.
    async fn obtain_channel(&self, peer: &str) -> Option<Arc<dyn DataChannel>> {
        let rtc = &self.inner.rtc;
        if let Some(channel) = rtc.open_channel(peer).await {
            return Some(channel);
        }

        // Subscribe first so the open/failed signal can't slip past
        let mut events = rtc.subscribe();
        if let Err(e) = rtc.connect(peer).await {
            warn!(peer = %peer, error = %e, "Could not start direct connection");
            return None;
        }

        let waited = tokio::time::timeout(self.inner.config.channel_timeout, async {
            while let Some(event) = events.recv().await {
                match event {
                    RtcEvent::ChannelOpen { peer: p } if p == peer => return true,
                    RtcEvent::ConnectionFailed { peer: p } if p == peer => return false,
                    _ => {}
                }
            }
            false
        })
        .await;

        match waited {
            Ok(true) => rtc.open_channel(peer).await,
            Ok(false) => {
                info!(peer = %peer, "Direct connection failed, relaying");
                None
            }
            Err(_) => {
                info!(peer = %peer, "Direct connection timed out, relaying");
                rtc.close(peer).await;
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Recipient decisions
    // -----------------------------------------------------------------------

    pub async fn accept(&self, id: &str) -> Result<(), TransferError> {
        self.resolve(id, true).await
    }

    pub async fn reject(&self, id: &str) -> Result<(), TransferError> {
        self.resolve(id, false).await
    }

    async fn resolve(&self, id: &str, accepted: bool) -> Result<(), TransferError> {
        let peer = {
            let mut registry = self.inner.registry.lock().await;
            if registry.was_rejected(id) {
                return Err(TransferError::AlreadyResolved(id.to_string()));
            }
            let Some(transfer) = registry.inbound.get_mut(id) else {
                return Err(TransferError::UnknownTransfer(id.to_string()));
            };
            if transfer.info.state != TransferState::Pending {
                return Err(TransferError::AlreadyResolved(id.to_string()));
            }
            let peer = transfer.info.peer.clone();
            if accepted {
                transfer.info.state = TransferState::Accepted;
            } else {
                registry.inbound.remove(id);
                registry.remember_reject(id);
            }
            peer
        };

        self.respond(&peer, id, accepted)?;
        if accepted {
            info!(transfer = %id, peer = %peer, "Accepted incoming transfer");
            self.inner.events.publish(TransferEvent::Accepted { id: id.to_string() });
        } else {
            info!(transfer = %id, peer = %peer, "Rejected incoming transfer");
            self.inner.events.publish(TransferEvent::Rejected { id: id.to_string() });
        }
        Ok(())
    }

    fn respond(&self, peer: &str, id: &str, accepted: bool) -> Result<(), TransferError> {
        let response = TransferResponsePayload {
            transfer_id: id.to_string(),
            accepted,
        };
        let env = Envelope::with_payload(MessageType::TransferResponse, &response)?.to(peer);
        self.inner.signaling.send(env)?;
        Ok(())
    }

    /// Stop a transfer locally. Nothing is sent to the other side.
    pub async fn cancel(&self, id: &str) -> Result<(), TransferError> {
        let mut registry = self.inner.registry.lock().await;
        if let Some(outbound) = registry.outbound.get_mut(id) {
            outbound.cancel.store(true, Ordering::SeqCst);
            // Wakes a sender still waiting for the response
            outbound.response.take();
            info!(transfer = %id, "Cancelling outgoing transfer");
            return Ok(());
        }
        if registry.inbound.remove(id).is_some() {
            drop(registry);
            info!(transfer = %id, "Cancelled incoming transfer");
            self.inner.events.publish(TransferEvent::Cancelled { id: id.to_string() });
            return Ok(());
        }
        Err(TransferError::UnknownTransfer(id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Inbound traffic
    // -----------------------------------------------------------------------

    async fn handle_signal(&self, event: SignalEvent) {
        match event {
            SignalEvent::TransferRequest { from, request } => self.on_request(from, request).await,
            SignalEvent::TransferResponse { from, response } => self.on_response(&from, response).await,
            SignalEvent::RelayChunk { from, chunk } => self.on_relay_chunk(&from, chunk).await,
            SignalEvent::PeerLeft(peer) => self.fail_inbound_from(&peer, "peer left", false).await,
            _ => {}
        }
    }

    async fn handle_rtc(&self, event: RtcEvent) {
        match event {
            RtcEvent::Message { peer, data } => self.on_frame(&peer, data).await,
            RtcEvent::ChannelClosed { peer } | RtcEvent::ConnectionFailed { peer } => {
                self.fail_inbound_from(&peer, "data channel closed", true).await
            }
            RtcEvent::ChannelOpen { .. } => {}
        }
    }

    /// Register an incoming request. The sender runs at most one transfer
    /// to us at a time, so a live inbound transfer from the same peer is
    /// one it has given up on and is dropped.
    async fn on_request(&self, from: String, request: TransferRequestPayload) {
        let id = request.transfer_id.clone();
        let (info, stale) = {
            let mut registry = self.inner.registry.lock().await;
            if registry.inbound.contains_key(&id) || registry.was_rejected(&id) {
                debug!(transfer = %id, "Ignoring repeated transfer request");
                return;
            }
            let stale: Vec<String> = registry
                .inbound
                .values()
                .filter(|t| t.info.peer == from)
                .map(|t| t.info.id.clone())
                .collect();
            for old in &stale {
                registry.inbound.remove(old);
            }

            let info = TransferInfo {
                id: id.clone(),
                peer: from.clone(),
                direction: Direction::Incoming,
                files: request.files,
                total_size: request.total_size,
                state: TransferState::Pending,
                path: None,
                bytes: 0,
            };
            registry.inbound.insert(
                id.clone(),
                Inbound {
                    info: info.clone(),
                    reassembly: Reassembly::Waiting,
                },
            );
            (info, stale)
        };

        for old in stale {
            warn!(transfer = %old, peer = %from, "Superseded by a new request from the same peer");
            self.inner.events.publish(TransferEvent::Failed {
                id: old,
                reason: "superseded".to_string(),
            });
        }
        info!(transfer = %id, peer = %from, files = info.files.len(), bytes = info.total_size, "Incoming transfer request");
        self.inner.events.publish(TransferEvent::Requested(info));
    }

    async fn on_response(&self, from: &str, response: TransferResponsePayload) {
        let mut registry = self.inner.registry.lock().await;
        let waiting = registry
            .outbound
            .get_mut(&response.transfer_id)
            .filter(|o| o.info.peer == from)
            .and_then(|o| o.response.take());
        match waiting {
            Some(tx) => {
                let _ = tx.send(response.accepted);
            }
            None => debug!(transfer = %response.transfer_id, peer = %from, "Ignoring response for transfer that is not pending"),
        }
    }

    async fn on_frame(&self, peer: &str, data: Bytes) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping undecodable frame");
                return;
            }
        };

        let (id, followup) = {
            let mut registry = self.inner.registry.lock().await;
            let Some(transfer) = registry.inbound.values_mut().find(|t| {
                t.info.peer == peer
                    && matches!(t.info.state, TransferState::Accepted | TransferState::Transferring)
            }) else {
                debug!(peer = %peer, "Frame with no accepted transfer");
                return;
            };
            let id = transfer.info.id.clone();

            if let Reassembly::Waiting = transfer.reassembly {
                transfer.reassembly = Reassembly::Direct(DirectReceiver::new(id.clone()));
                transfer.info.state = TransferState::Transferring;
                transfer.info.path = Some(DeliveryPath::Direct);
                self.inner.events.publish(TransferEvent::Started {
                    id: id.clone(),
                    path: DeliveryPath::Direct,
                });
            }
            let Reassembly::Direct(receiver) = &mut transfer.reassembly else {
                debug!(transfer = %id, "Direct frame for relayed transfer");
                return;
            };

            let followup = match receiver.accept(frame) {
                Ok(step) => {
                    if step.bytes > 0 {
                        transfer.info.bytes += step.bytes;
                        self.publish_progress(&transfer.info);
                    }
                    if step.file.is_some() || step.complete {
                        Followup::Deliver(step.file.into_iter().collect(), step.complete)
                    } else {
                        Followup::None
                    }
                }
                Err(e) => Followup::Fail(e),
            };
            (id, followup)
        };

        self.follow_up(&id, followup).await;
    }

    async fn on_relay_chunk(&self, from: &str, chunk: RelayChunkPayload) {
        let id = chunk.transfer_id.clone();
        let followup = {
            let mut registry = self.inner.registry.lock().await;
            let Some(transfer) = registry.inbound.get_mut(&id).filter(|t| {
                t.info.peer == from
                    && matches!(t.info.state, TransferState::Accepted | TransferState::Transferring)
            }) else {
                debug!(transfer = %id, peer = %from, "Relay chunk with no accepted transfer");
                return;
            };

            if let Reassembly::Waiting = transfer.reassembly {
                transfer.reassembly = Reassembly::Relay(RelayReceiver::new(transfer.info.files.clone()));
                transfer.info.state = TransferState::Transferring;
                transfer.info.path = Some(DeliveryPath::Relay);
                self.inner.events.publish(TransferEvent::Started {
                    id: id.clone(),
                    path: DeliveryPath::Relay,
                });
            }
            let Reassembly::Relay(receiver) = &mut transfer.reassembly else {
                debug!(transfer = %id, "Relay chunk for direct transfer");
                return;
            };

            match receiver.accept(chunk) {
                Ok(step) => {
                    transfer.info.bytes += step.bytes;
                    self.publish_progress(&transfer.info);
                    match step.files {
                        Some(files) => Followup::Deliver(files, true),
                        None => Followup::None,
                    }
                }
                Err(e) => Followup::Fail(e),
            }
        };

        self.follow_up(&id, followup).await;
    }

    fn publish_progress(&self, info: &TransferInfo) {
        self.inner.events.publish(TransferEvent::Progress {
            id: info.id.clone(),
            bytes: info.bytes,
            total: info.total_size,
            fraction: info.progress(),
        });
    }

    /// Hand finished files to the sink and settle the transfer. Runs with
    /// the registry unlocked.
    async fn follow_up(&self, id: &str, followup: Followup) {
        match followup {
            Followup::None => {}
            Followup::Fail(e) => self.end_inbound(id, Outcome::Failed(e.to_string())).await,
            Followup::Deliver(files, complete) => {
                for file in files {
                    let name = file.name.clone();
                    let size = file.data.len() as u64;
                    let delivered = self
                        .inner
                        .sink
                        .deliver(ReceivedFile {
                            transfer_id: id.to_string(),
                            name: file.name,
                            mime: file.mime,
                            data: file.data,
                        })
                        .await;
                    if let Err(e) = delivered {
                        let e = TransferError::from(e);
                        self.end_inbound(id, Outcome::Failed(e.to_string())).await;
                        return;
                    }
                    debug!(transfer = %id, file = %name, size, "File received");
                    self.inner.events.publish(TransferEvent::FileReceived {
                        id: id.to_string(),
                        name,
                        size,
                    });
                }
                if complete {
                    self.end_inbound(id, Outcome::Completed).await;
                }
            }
        }
    }

    async fn end_inbound(&self, id: &str, outcome: Outcome) {
        if self.inner.registry.lock().await.inbound.remove(id).is_none() {
            return;
        }
        match &outcome {
            Outcome::Failed(reason) => warn!(transfer = %id, %reason, "Incoming transfer failed"),
            _ => info!(transfer = %id, "Incoming transfer finished"),
        }
        self.inner.events.publish(outcome.event(id.to_string()));
    }

    /// Fail inbound transfers from `peer`. With `direct_only`, only those
    /// already receiving over the data channel.
    async fn fail_inbound_from(&self, peer: &str, reason: &str, direct_only: bool) {
        let ids: Vec<String> = {
            let registry = self.inner.registry.lock().await;
            registry
                .inbound
                .values()
                .filter(|t| t.info.peer == peer)
                .filter(|t| !direct_only || matches!(t.reassembly, Reassembly::Direct(_)))
                .map(|t| t.info.id.clone())
                .collect()
        };
        for id in ids {
            self.end_inbound(&id, Outcome::Failed(reason.to_string())).await;
        }
    }
}
