//! In-memory connectivity backend.
//!
//! Sessions created through one [`MockNetwork`] are paired by peer id. When
//! the offering side applies the answer, the link comes up (or fails, or
//! stays silent) according to the [`LinkMode`] set for that direction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use peerdrop_shared::protocol::{IceCandidatePayload, SdpPayload};

use super::{BackendEvent, BackendSink, ConnectionEvent, DataChannel, PeerConnection, PeerConnectionFactory};
use crate::error::RtcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Connect,
    Fail,
    /// Never reports anything
    Silent,
}

type Pair = (String, String);

struct Endpoint {
    generation: u64,
    sink: BackendSink,
}

#[derive(Default)]
struct Net {
    endpoints: HashMap<Pair, Endpoint>,
    modes: HashMap<Pair, LinkMode>,
    log: HashMap<Pair, Vec<String>>,
    links: HashMap<Pair, Arc<AtomicBool>>,
}

#[derive(Clone, Default)]
pub struct MockNetwork {
    net: Arc<Mutex<Net>>,
    buffered: Arc<AtomicUsize>,
    frames: Arc<AtomicUsize>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self, local: &str) -> Arc<dyn PeerConnectionFactory> {
        Arc::new(MockFactory {
            local: local.to_string(),
            network: self.clone(),
        })
    }

    /// How a link offered by `caller` to `callee` behaves.
    pub fn set_mode(&self, caller: &str, callee: &str, mode: LinkMode) {
        self.net
            .lock()
            .unwrap()
            .modes
            .insert((caller.to_string(), callee.to_string()), mode);
    }

    /// Buffered amount every channel reports.
    pub fn set_buffered(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    /// Total messages sent over any channel.
    pub fn frames_sent(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    /// Operations `local`'s connection to `remote` has performed.
    pub fn log(&self, local: &str, remote: &str) -> Vec<String> {
        self.net
            .lock()
            .unwrap()
            .log
            .get(&(local.to_string(), remote.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the data channel between `a` and `b`, notifying both ends.
    pub fn drop_link(&self, a: &str, b: &str) {
        let net = self.net.lock().unwrap();
        let key = ordered(a, b);
        if let Some(open) = net.links.get(&key) {
            open.store(false, Ordering::SeqCst);
        }
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(ep) = net.endpoints.get(&(local.to_string(), remote.to_string())) {
                let _ = ep.sink.send(BackendEvent {
                    peer: remote.to_string(),
                    generation: ep.generation,
                    event: ConnectionEvent::ChannelClosed,
                });
            }
        }
    }

    fn record(&self, local: &str, remote: &str, entry: String) {
        self.net
            .lock()
            .unwrap()
            .log
            .entry((local.to_string(), remote.to_string()))
            .or_default()
            .push(entry);
    }

    fn emit(&self, local: &str, remote: &str, event: ConnectionEvent) {
        let net = self.net.lock().unwrap();
        if let Some(ep) = net.endpoints.get(&(local.to_string(), remote.to_string())) {
            let _ = ep.sink.send(BackendEvent {
                peer: remote.to_string(),
                generation: ep.generation,
                event,
            });
        }
    }

    fn establish(&self, caller: &str, callee: &str) {
        let mut net = self.net.lock().unwrap();
        let mode = net
            .modes
            .get(&(caller.to_string(), callee.to_string()))
            .copied()
            .unwrap_or(LinkMode::Connect);

        let caller_key = (caller.to_string(), callee.to_string());
        let callee_key = (callee.to_string(), caller.to_string());
        let (Some(c), Some(r)) = (net.endpoints.get(&caller_key), net.endpoints.get(&callee_key)) else {
            if let Some(c) = net.endpoints.get(&caller_key) {
                let _ = c.sink.send(BackendEvent {
                    peer: callee.to_string(),
                    generation: c.generation,
                    event: ConnectionEvent::Failed,
                });
            }
            return;
        };

        match mode {
            LinkMode::Silent => {}
            LinkMode::Fail => {
                let _ = c.sink.send(BackendEvent {
                    peer: callee.to_string(),
                    generation: c.generation,
                    event: ConnectionEvent::Failed,
                });
            }
            LinkMode::Connect => {
                let open = Arc::new(AtomicBool::new(true));
                let to_callee: Arc<dyn DataChannel> = Arc::new(MockChannel {
                    from: caller.to_string(),
                    to: Endpoint {
                        generation: r.generation,
                        sink: r.sink.clone(),
                    },
                    open: open.clone(),
                    buffered: self.buffered.clone(),
                    frames: self.frames.clone(),
                });
                let to_caller: Arc<dyn DataChannel> = Arc::new(MockChannel {
                    from: callee.to_string(),
                    to: Endpoint {
                        generation: c.generation,
                        sink: c.sink.clone(),
                    },
                    open: open.clone(),
                    buffered: self.buffered.clone(),
                    frames: self.frames.clone(),
                });

                for (ep, peer, channel) in [(c, callee, to_callee), (r, caller, to_caller)] {
                    let _ = ep.sink.send(BackendEvent {
                        peer: peer.to_string(),
                        generation: ep.generation,
                        event: ConnectionEvent::Connected,
                    });
                    let _ = ep.sink.send(BackendEvent {
                        peer: peer.to_string(),
                        generation: ep.generation,
                        event: ConnectionEvent::ChannelOpen(channel),
                    });
                }
                net.links.insert(ordered(caller, callee), open);
            }
        }
    }
}

fn ordered(a: &str, b: &str) -> Pair {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

struct MockFactory {
    local: String,
    network: MockNetwork,
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    async fn create(
        &self,
        peer: &str,
        generation: u64,
        events: BackendSink,
    ) -> Result<Arc<dyn PeerConnection>, RtcError> {
        self.network.net.lock().unwrap().endpoints.insert(
            (self.local.clone(), peer.to_string()),
            Endpoint {
                generation,
                sink: events,
            },
        );
        Ok(Arc::new(MockPeerConnection {
            local: self.local.clone(),
            remote: peer.to_string(),
            network: self.network.clone(),
        }))
    }
}

struct MockPeerConnection {
    local: String,
    remote: String,
    network: MockNetwork,
}

impl MockPeerConnection {
    fn record(&self, entry: impl Into<String>) {
        self.network.record(&self.local, &self.remote, entry.into());
    }

    fn trickle(&self, tag: &str) {
        self.network.emit(
            &self.local,
            &self.remote,
            ConnectionEvent::LocalCandidate(IceCandidatePayload {
                candidate: format!("candidate:{}-{}", self.local, tag),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }),
        );
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_data_channel(&self, _label: &str) -> Result<(), RtcError> {
        self.record("channel");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SdpPayload, RtcError> {
        self.record("offer");
        self.trickle("offer");
        Ok(SdpPayload {
            sdp: format!("mock-offer:{}", self.local),
            sdp_type: "offer".into(),
        })
    }

    async fn create_answer(&self) -> Result<SdpPayload, RtcError> {
        self.record("answer");
        self.trickle("answer");
        Ok(SdpPayload {
            sdp: format!("mock-answer:{}", self.local),
            sdp_type: "answer".into(),
        })
    }

    async fn set_remote_description(&self, sdp: SdpPayload) -> Result<(), RtcError> {
        self.record(format!("remote:{}", sdp.sdp_type));
        if sdp.sdp_type == "answer" {
            self.network.establish(&self.local, &self.remote);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), RtcError> {
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) {
        self.record("close");
    }
}

struct MockChannel {
    from: String,
    to: Endpoint,
    open: Arc<AtomicBool>,
    buffered: Arc<AtomicUsize>,
    frames: Arc<AtomicUsize>,
}

#[async_trait]
impl DataChannel for MockChannel {
    async fn send(&self, data: Bytes) -> Result<(), RtcError> {
        if !self.is_open() {
            return Err(RtcError::ChannelClosed);
        }
        self.frames.fetch_add(1, Ordering::SeqCst);
        self.to
            .sink
            .send(BackendEvent {
                peer: self.from.clone(),
                generation: self.to.generation,
                event: ConnectionEvent::Message(data),
            })
            .map_err(|_| RtcError::ChannelClosed)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
