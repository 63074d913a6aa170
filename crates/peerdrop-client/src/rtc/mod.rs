//! Peer-to-peer connectivity sessions.
//!
//! [`RtcManager`] negotiates one session per remote peer over the signaling
//! channel (offer, answer, trickled candidates) and surfaces the resulting
//! data channel. The WebRTC stack itself sits behind [`PeerConnectionFactory`]
//! so negotiation can run against an in-memory backend in tests.
//!
//! Backend callbacks arrive as [`BackendEvent`]s tagged with the session
//! generation that produced them; events from a replaced session are dropped.

#[cfg(test)]
pub mod mock;
pub mod webrtc_backend;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use peerdrop_shared::constants::DATA_CHANNEL_LABEL;
use peerdrop_shared::protocol::{IceCandidatePayload, SdpPayload};
use peerdrop_shared::{Envelope, MessageType};

use crate::error::RtcError;
use crate::events::EventBus;
use crate::signaling::{SignalEvent, SignalingChannel};

pub use webrtc_backend::WebRtcFactory;

/// Ordered, reliable message channel to one peer.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<(), RtcError>;

    /// Bytes queued locally but not yet handed to the network
    async fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// One negotiated connection. Offer/answer creation also applies the
/// result as the local description.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> Result<(), RtcError>;
    async fn create_offer(&self) -> Result<SdpPayload, RtcError>;
    async fn create_answer(&self) -> Result<SdpPayload, RtcError>;
    async fn set_remote_description(&self, sdp: SdpPayload) -> Result<(), RtcError>;
    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), RtcError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection to `peer`. Everything the backend observes
    /// afterwards is reported on `events`, tagged with `generation`.
    async fn create(
        &self,
        peer: &str,
        generation: u64,
        events: BackendSink,
    ) -> Result<Arc<dyn PeerConnection>, RtcError>;
}

#[derive(Clone)]
pub enum ConnectionEvent {
    LocalCandidate(IceCandidatePayload),
    Connected,
    Failed,
    ChannelOpen(Arc<dyn DataChannel>),
    Message(Bytes),
    ChannelClosed,
}

pub struct BackendEvent {
    pub peer: String,
    pub generation: u64,
    pub event: ConnectionEvent,
}

pub type BackendSink = mpsc::UnboundedSender<BackendEvent>;

/// What the rest of the agent sees.
#[derive(Debug, Clone)]
pub enum RtcEvent {
    ChannelOpen { peer: String },
    ChannelClosed { peer: String },
    ConnectionFailed { peer: String },
    Message { peer: String, data: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    New,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
}

struct PeerSession {
    generation: u64,
    role: Role,
    negotiation: Negotiation,
    remote_applied: bool,
    pc: Arc<dyn PeerConnection>,
    channel: Option<Arc<dyn DataChannel>>,
}

#[derive(Default)]
struct State {
    sessions: HashMap<String, PeerSession>,
    /// Remote candidates that arrived before a remote description was applied
    pending_candidates: HashMap<String, Vec<IceCandidatePayload>>,
    next_generation: u64,
}

struct Inner {
    factory: Arc<dyn PeerConnectionFactory>,
    signaling: SignalingChannel,
    state: Mutex<State>,
    events: EventBus<RtcEvent>,
    backend_tx: BackendSink,
    task: OnceLock<AbortHandle>,
}

#[derive(Clone)]
pub struct RtcManager {
    inner: Arc<Inner>,
}

impl RtcManager {
    pub fn spawn(factory: Arc<dyn PeerConnectionFactory>, signaling: SignalingChannel) -> Self {
        let (backend_tx, mut backend_rx) = mpsc::unbounded_channel();
        let mut signals = signaling.subscribe();

        let manager = Self {
            inner: Arc::new(Inner {
                factory,
                signaling,
                state: Mutex::new(State::default()),
                events: EventBus::new(),
                backend_tx,
                task: OnceLock::new(),
            }),
        };

        let this = manager.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = signals.recv() => match signal {
                        Some(event) => this.handle_signal(event).await,
                        None => break,
                    },
                    Some(event) = backend_rx.recv() => this.handle_backend(event).await,
                }
            }
            debug!("RTC manager stopped");
        });
        let _ = manager.inner.task.set(task.abort_handle());

        manager
    }

    /// Stop handling signaling and backend events.
    pub fn stop(&self) {
        if let Some(task) = self.inner.task.get() {
            task.abort();
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RtcEvent> {
        self.inner.events.subscribe()
    }

    /// Start a session to `peer` as the offering side.
    ///
    /// Returns once the offer is sent; watch for [`RtcEvent::ChannelOpen`] or
    /// [`RtcEvent::ConnectionFailed`]. No-op if a channel is already open.
    pub async fn connect(&self, peer: &str) -> Result<(), RtcError> {
        if self.has_open_channel(peer).await {
            return Ok(());
        }

        let (generation, pc) = self.new_session(peer, Role::Caller).await?;
        let result: Result<(), RtcError> = async {
            pc.create_data_channel(DATA_CHANNEL_LABEL).await?;
            let offer = pc.create_offer().await?;
            self.set_negotiation(peer, generation, Negotiation::OfferSent).await;
            let env = Envelope::with_payload(MessageType::Offer, &offer)?.to(peer);
            self.inner.signaling.send(env)?;
            Ok(())
        }
        .await;

        if result.is_err() {
            self.drop_session(peer, generation).await;
        } else {
            debug!(peer = %peer, generation, "Offer sent");
        }
        result
    }

    /// The open data channel to `peer`, if any.
    pub async fn open_channel(&self, peer: &str) -> Option<Arc<dyn DataChannel>> {
        let state = self.inner.state.lock().await;
        state
            .sessions
            .get(peer)
            .and_then(|s| s.channel.clone())
            .filter(|c| c.is_open())
    }

    pub async fn has_open_channel(&self, peer: &str) -> bool {
        self.open_channel(peer).await.is_some()
    }

    pub async fn negotiation(&self, peer: &str) -> Option<(Role, Negotiation)> {
        let state = self.inner.state.lock().await;
        state.sessions.get(peer).map(|s| (s.role, s.negotiation))
    }

    /// Tear down the session with `peer`.
    pub async fn close(&self, peer: &str) {
        let session = {
            let mut state = self.inner.state.lock().await;
            state.pending_candidates.remove(peer);
            state.sessions.remove(peer)
        };
        if let Some(session) = session {
            debug!(peer = %peer, "Closing session");
            if let Some(channel) = session.channel {
                channel.close().await;
            }
            session.pc.close().await;
        }
    }

    // -----------------------------------------------------------------------
    // Session bookkeeping
    // -----------------------------------------------------------------------

    /// Create a fresh session for `peer`, replacing (and closing) any old one.
    async fn new_session(&self, peer: &str, role: Role) -> Result<(u64, Arc<dyn PeerConnection>), RtcError> {
        let generation = {
            let mut state = self.inner.state.lock().await;
            state.next_generation += 1;
            state.next_generation
        };

        let pc = self
            .inner
            .factory
            .create(peer, generation, self.inner.backend_tx.clone())
            .await?;

        let old = {
            let mut state = self.inner.state.lock().await;
            if role == Role::Caller {
                // Candidates queued before our own offer belong to nothing
                state.pending_candidates.remove(peer);
            }
            state.sessions.insert(
                peer.to_string(),
                PeerSession {
                    generation,
                    role,
                    negotiation: Negotiation::New,
                    remote_applied: false,
                    pc: pc.clone(),
                    channel: None,
                },
            )
        };
        if let Some(old) = old {
            debug!(peer = %peer, old = old.generation, new = generation, "Replacing session");
            old.pc.close().await;
        }

        Ok((generation, pc))
    }

    async fn drop_session(&self, peer: &str, generation: u64) {
        let removed = {
            let mut state = self.inner.state.lock().await;
            match state.sessions.get(peer) {
                Some(s) if s.generation == generation => state.sessions.remove(peer),
                _ => None,
            }
        };
        if let Some(session) = removed {
            session.pc.close().await;
        }
    }

    async fn set_negotiation(&self, peer: &str, generation: u64, negotiation: Negotiation) {
        let mut state = self.inner.state.lock().await;
        if let Some(s) = state.sessions.get_mut(peer).filter(|s| s.generation == generation) {
            s.negotiation = negotiation;
        }
    }

    /// Mark the remote description applied and hand back the candidates
    /// that were waiting for it, in arrival order.
    async fn remote_applied(&self, peer: &str, generation: u64) -> Vec<IceCandidatePayload> {
        let mut state = self.inner.state.lock().await;
        match state.sessions.get_mut(peer) {
            Some(s) if s.generation == generation => s.remote_applied = true,
            _ => return Vec::new(),
        }
        state.pending_candidates.remove(peer).unwrap_or_default()
    }

    async fn apply_candidates(&self, peer: &str, pc: &Arc<dyn PeerConnection>, candidates: Vec<IceCandidatePayload>) {
        if !candidates.is_empty() {
            debug!(peer = %peer, count = candidates.len(), "Applying queued candidates");
        }
        for candidate in candidates {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!(peer = %peer, error = %e, "Failed to add queued candidate");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound signaling
    // -----------------------------------------------------------------------

    pub(crate) async fn handle_signal(&self, event: SignalEvent) {
        match event {
            SignalEvent::Offer { from, sdp } => {
                if let Err(e) = self.on_offer(&from, sdp).await {
                    warn!(peer = %from, error = %e, "Failed to answer offer");
                    self.close(&from).await;
                    self.inner.events.publish(RtcEvent::ConnectionFailed { peer: from });
                }
            }
            SignalEvent::Answer { from, sdp } => {
                if let Err(e) = self.on_answer(&from, sdp).await {
                    warn!(peer = %from, error = %e, "Failed to apply answer");
                    self.close(&from).await;
                    self.inner.events.publish(RtcEvent::ConnectionFailed { peer: from });
                }
            }
            SignalEvent::IceCandidate { from, candidate } => self.on_candidate(&from, candidate).await,
            SignalEvent::PeerLeft(peer) => self.close(&peer).await,
            _ => {}
        }
    }

    async fn on_offer(&self, from: &str, sdp: SdpPayload) -> Result<(), RtcError> {
        let (generation, pc) = self.new_session(from, Role::Callee).await?;
        self.set_negotiation(from, generation, Negotiation::OfferReceived).await;

        pc.set_remote_description(sdp).await?;
        let queued = self.remote_applied(from, generation).await;
        self.apply_candidates(from, &pc, queued).await;

        let answer = pc.create_answer().await?;
        self.set_negotiation(from, generation, Negotiation::AnswerSent).await;
        let env = Envelope::with_payload(MessageType::Answer, &answer)?.to(from);
        self.inner.signaling.send(env)?;
        debug!(peer = %from, generation, "Answer sent");
        Ok(())
    }

    async fn on_answer(&self, from: &str, sdp: SdpPayload) -> Result<(), RtcError> {
        let found = {
            let state = self.inner.state.lock().await;
            state
                .sessions
                .get(from)
                .filter(|s| s.role == Role::Caller && s.negotiation == Negotiation::OfferSent)
                .map(|s| (s.generation, s.pc.clone()))
        };
        let Some((generation, pc)) = found else {
            debug!(peer = %from, "Ignoring answer without a pending offer");
            return Ok(());
        };

        pc.set_remote_description(sdp).await?;
        self.set_negotiation(from, generation, Negotiation::AnswerReceived).await;
        let queued = self.remote_applied(from, generation).await;
        self.apply_candidates(from, &pc, queued).await;
        Ok(())
    }

    async fn on_candidate(&self, from: &str, candidate: IceCandidatePayload) {
        let ready = {
            let mut state = self.inner.state.lock().await;
            match state.sessions.get(from).filter(|s| s.remote_applied) {
                Some(s) => Some(s.pc.clone()),
                None => {
                    state
                        .pending_candidates
                        .entry(from.to_string())
                        .or_default()
                        .push(candidate.clone());
                    None
                }
            }
        };
        match ready {
            Some(pc) => {
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    warn!(peer = %from, error = %e, "Failed to add candidate");
                }
            }
            None => debug!(peer = %from, "Queued early candidate"),
        }
    }

    // -----------------------------------------------------------------------
    // Backend callbacks
    // -----------------------------------------------------------------------

    async fn handle_backend(&self, BackendEvent { peer, generation, event }: BackendEvent) {
        let current = {
            let state = self.inner.state.lock().await;
            state.sessions.get(&peer).map(|s| s.generation) == Some(generation)
        };
        if !current {
            debug!(peer = %peer, generation, "Dropping event from stale session");
            return;
        }

        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                let sent = Envelope::with_payload(MessageType::IceCandidate, &candidate)
                    .map_err(RtcError::from)
                    .and_then(|env| {
                        self.inner
                            .signaling
                            .send(env.to(peer.as_str()))
                            .map_err(RtcError::from)
                    });
                if let Err(e) = sent {
                    warn!(peer = %peer, error = %e, "Failed to send candidate");
                }
            }
            ConnectionEvent::Connected => info!(peer = %peer, "Peer connection established"),
            ConnectionEvent::Failed => {
                warn!(peer = %peer, "Peer connection failed");
                self.drop_session(&peer, generation).await;
                self.inner.events.publish(RtcEvent::ConnectionFailed { peer });
            }
            ConnectionEvent::ChannelOpen(channel) => {
                {
                    let mut state = self.inner.state.lock().await;
                    if let Some(s) = state.sessions.get_mut(&peer) {
                        s.channel = Some(channel);
                    }
                }
                info!(peer = %peer, "Data channel open");
                self.inner.events.publish(RtcEvent::ChannelOpen { peer });
            }
            ConnectionEvent::Message(data) => {
                self.inner.events.publish(RtcEvent::Message { peer, data });
            }
            ConnectionEvent::ChannelClosed => {
                {
                    let mut state = self.inner.state.lock().await;
                    if let Some(s) = state.sessions.get_mut(&peer) {
                        s.channel = None;
                    }
                }
                info!(peer = %peer, "Data channel closed");
                self.inner.events.publish(RtcEvent::ChannelClosed { peer });
            }
        }
    }
}
