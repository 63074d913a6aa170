//! Production connectivity backend on top of the `webrtc` crate.
//!
//! Callbacks registered on the peer connection and data channel only
//! forward into the manager's [`BackendSink`]; all decisions are taken
//! there. Candidates are trickled, not embedded in the SDP.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use peerdrop_shared::protocol::{IceCandidatePayload, SdpPayload};

use super::{BackendEvent, BackendSink, ConnectionEvent, DataChannel, PeerConnection, PeerConnectionFactory};
use crate::error::RtcError;

fn backend(e: webrtc::Error) -> RtcError {
    RtcError::Backend(e.to_string())
}

/// Builds real WebRTC peer connections.
pub struct WebRtcFactory {
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    async fn new_connection(&self) -> Result<Arc<RTCPeerConnection>, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(backend)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        api.new_peer_connection(config).await.map(Arc::new).map_err(backend)
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        peer: &str,
        generation: u64,
        events: BackendSink,
    ) -> Result<Arc<dyn PeerConnection>, RtcError> {
        let pc = self.new_connection().await?;
        let forward = Forwarder {
            peer: peer.to_string(),
            generation,
            events,
        };

        // Work must happen inside the returned futures
        let fwd = forward.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let fwd = fwd.clone();
            Box::pin(async move {
                let Some(init) = candidate.and_then(|c| c.to_json().ok()) else {
                    return;
                };
                fwd.send(ConnectionEvent::LocalCandidate(IceCandidatePayload {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                }));
            })
        }));

        let fwd = forward.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let fwd = fwd.clone();
            Box::pin(async move {
                debug!(peer = %fwd.peer, ?state, "Peer connection state");
                match state {
                    RTCPeerConnectionState::Connected => fwd.send(ConnectionEvent::Connected),
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                        fwd.send(ConnectionEvent::Failed)
                    }
                    _ => {}
                }
            })
        }));

        // Answering side: the channel arrives from the remote
        let fwd = forward.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let fwd = fwd.clone();
            Box::pin(async move {
                info!(peer = %fwd.peer, label = dc.label(), "Received data channel");
                fwd.wire(dc);
            })
        }));

        Ok(Arc::new(WebRtcConnection { pc, forward }))
    }
}

#[derive(Clone)]
struct Forwarder {
    peer: String,
    generation: u64,
    events: BackendSink,
}

impl Forwarder {
    fn send(&self, event: ConnectionEvent) {
        let _ = self.events.send(BackendEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        });
    }

    fn wire(&self, dc: Arc<RTCDataChannel>) {
        let fwd = self.clone();
        let opened = dc.clone();
        dc.on_open(Box::new(move || {
            let fwd = fwd.clone();
            let channel: Arc<dyn DataChannel> = Arc::new(WebRtcChannel { dc: opened.clone() });
            Box::pin(async move {
                fwd.send(ConnectionEvent::ChannelOpen(channel));
            })
        }));

        let fwd = self.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let fwd = fwd.clone();
            Box::pin(async move {
                fwd.send(ConnectionEvent::Message(msg.data));
            })
        }));

        let fwd = self.clone();
        dc.on_close(Box::new(move || {
            let fwd = fwd.clone();
            Box::pin(async move {
                fwd.send(ConnectionEvent::ChannelClosed);
            })
        }));
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    forward: Forwarder,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_data_channel(&self, label: &str) -> Result<(), RtcError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(backend)?;
        self.forward.wire(dc);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SdpPayload, RtcError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(backend)?;
        Ok(SdpPayload {
            sdp: offer.sdp,
            sdp_type: "offer".into(),
        })
    }

    async fn create_answer(&self) -> Result<SdpPayload, RtcError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(backend)?;
        Ok(SdpPayload {
            sdp: answer.sdp,
            sdp_type: "answer".into(),
        })
    }

    async fn set_remote_description(&self, sdp: SdpPayload) -> Result<(), RtcError> {
        let desc = match sdp.sdp_type.as_str() {
            "offer" => RTCSessionDescription::offer(sdp.sdp),
            "answer" => RTCSessionDescription::answer(sdp.sdp),
            other => return Err(RtcError::DescriptionType(other.to_string())),
        }
        .map_err(backend)?;
        self.pc.set_remote_description(desc).await.map_err(backend)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), RtcError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(backend)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(peer = %self.forward.peer, error = %e, "Error closing peer connection");
        }
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    async fn send(&self, data: Bytes) -> Result<(), RtcError> {
        self.dc.send(&data).await.map(|_| ()).map_err(backend)
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}
