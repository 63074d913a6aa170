//! Client side of the signaling link.
//!
//! A background driver owns the connection and the [`ReconnectMachine`].
//! Callers talk to it through a cloneable [`SignalingChannel`] handle:
//! outbound envelopes are queued while the link is down and flushed in
//! order right after the next successful connect; inbound envelopes are
//! decoded into [`SignalEvent`]s and fanned out on an [`EventBus`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use peerdrop_shared::protocol::{
    IceCandidatePayload, JoinPayload, PeerJoinedPayload, PeerLeftPayload, PeersPayload,
    RelayChunkPayload, RoomCodePayload, RoomErrorPayload, RoomJoinedPayload, SdpPayload,
    TransferRequestPayload, TransferResponsePayload,
};
use peerdrop_shared::{Envelope, MessageType, PeerInfo, ProtocolError};

use crate::error::SignalingError;
use crate::events::EventBus;
use crate::reconnect::{LinkState, ReconnectMachine, ReconnectPolicy};

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub reconnect: ReconnectPolicy,
    /// Keepalive ping period while connected
    pub ping_interval: Duration,
}

/// An established transport: one text envelope per message each way.
pub struct Link {
    pub tx: mpsc::UnboundedSender<String>,
    pub rx: mpsc::UnboundedReceiver<String>,
}

/// Opens transports to the hub.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link, SignalingError>;
}

/// WebSocket connector.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, SignalingError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Writer: ends when the link handle is dropped
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    debug!(error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Reader: dropping in_tx tells the driver the link is gone
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        // The hub may coalesce several envelopes per frame
                        for line in text.split('\n').filter(|l| !l.trim().is_empty()) {
                            if in_tx.send(line.to_string()).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(Link {
            tx: out_tx,
            rx: in_rx,
        })
    }
}

/// Inbound signaling, decoded.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    Connected,
    Disconnected,
    Peers(Vec<PeerInfo>),
    PeerJoined(PeerInfo),
    PeerLeft(String),
    RoomCreated(String),
    RoomJoined { code: String, peers: Vec<PeerInfo> },
    RoomLeft(String),
    RoomError(String),
    Offer { from: String, sdp: SdpPayload },
    Answer { from: String, sdp: SdpPayload },
    IceCandidate { from: String, candidate: IceCandidatePayload },
    TransferRequest { from: String, request: TransferRequestPayload },
    TransferResponse { from: String, response: TransferResponsePayload },
    RelayChunk { from: String, chunk: RelayChunkPayload },
}

/// Map an inbound envelope to an event. `Ok(None)` for envelopes that
/// carry nothing for subscribers.
pub fn decode_event(env: &Envelope) -> Result<Option<SignalEvent>, ProtocolError> {
    let from = || env.peer_id.clone().unwrap_or_default();
    let event = match env.kind {
        MessageType::Peers => SignalEvent::Peers(env.payload_as::<PeersPayload>()?.peers),
        MessageType::PeerJoined => SignalEvent::PeerJoined(env.payload_as::<PeerJoinedPayload>()?.peer),
        MessageType::PeerLeft => SignalEvent::PeerLeft(env.payload_as::<PeerLeftPayload>()?.peer_id),
        MessageType::RoomCreated => SignalEvent::RoomCreated(env.payload_as::<RoomCodePayload>()?.code),
        MessageType::RoomJoined => {
            let p: RoomJoinedPayload = env.payload_as()?;
            SignalEvent::RoomJoined {
                code: p.code,
                peers: p.peers,
            }
        }
        MessageType::RoomLeft => SignalEvent::RoomLeft(env.payload_as::<RoomCodePayload>()?.code),
        MessageType::RoomError => SignalEvent::RoomError(env.payload_as::<RoomErrorPayload>()?.error),
        MessageType::Offer => SignalEvent::Offer {
            from: from(),
            sdp: env.payload_as()?,
        },
        MessageType::Answer => SignalEvent::Answer {
            from: from(),
            sdp: env.payload_as()?,
        },
        MessageType::IceCandidate => SignalEvent::IceCandidate {
            from: from(),
            candidate: env.payload_as()?,
        },
        MessageType::TransferRequest => SignalEvent::TransferRequest {
            from: from(),
            request: env.payload_as()?,
        },
        MessageType::TransferResponse => SignalEvent::TransferResponse {
            from: from(),
            response: env.payload_as()?,
        },
        MessageType::RelayChunk => SignalEvent::RelayChunk {
            from: from(),
            chunk: env.payload_as()?,
        },
        _ => return Ok(None),
    };

    if env.kind.is_relayed() && env.peer_id.is_none() {
        warn!(kind = ?env.kind, "Dropping relayed message without sender");
        return Ok(None);
    }
    Ok(Some(event))
}

enum Command {
    Send(Envelope),
    Disconnect,
    Reconnect,
}

/// Handle to the signaling driver.
#[derive(Clone)]
pub struct SignalingChannel {
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<EventBus<SignalEvent>>,
    state: watch::Receiver<LinkState>,
    task: Arc<AbortHandle>,
}

impl SignalingChannel {
    /// Start the driver and begin connecting. `identity` is announced with
    /// a `join` on every (re)connect.
    pub fn spawn(connector: Arc<dyn Connector>, identity: JoinPayload, config: SignalingConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let events = Arc::new(EventBus::new());

        let driver = Driver {
            connector,
            identity,
            ping_interval: config.ping_interval,
            machine: ReconnectMachine::new(config.reconnect),
            queue: VecDeque::new(),
            commands: cmd_rx,
            events: events.clone(),
            state: state_tx,
        };
        let task = tokio::spawn(driver.run());

        Self {
            commands: cmd_tx,
            events,
            state: state_rx,
            task: Arc::new(task.abort_handle()),
        }
    }

    /// Send an envelope now, or queue it until the link is back.
    pub fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        self.commands
            .send(Command::Send(envelope))
            .map_err(|_| SignalingError::Closed)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalEvent> {
        self.events.subscribe()
    }

    /// Close the link and stop reconnecting until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Stop the driver for good, dropping the link and anything queued.
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Reconnect now with a fresh retry budget.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Wait until the link reaches `target`.
    pub async fn wait_for(&self, target: LinkState) -> Result<(), SignalingError> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| SignalingError::Closed)
    }
}

enum Flow {
    Continue,
    Exit,
}

struct Driver {
    connector: Arc<dyn Connector>,
    identity: JoinPayload,
    ping_interval: Duration,
    machine: ReconnectMachine,
    queue: VecDeque<Envelope>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: Arc<EventBus<SignalEvent>>,
    state: watch::Sender<LinkState>,
}

impl Driver {
    async fn run(mut self) {
        self.machine.start();
        loop {
            self.publish_state();
            let flow = match self.machine.state() {
                LinkState::Connecting => self.attempt().await,
                _ => self.idle().await,
            };
            if let Flow::Exit = flow {
                debug!("Signaling driver stopped");
                return;
            }
        }
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        self.state.send_if_modified(|s| {
            let changed = *s != state;
            *s = state;
            changed
        });
    }

    /// Disconnected or closed: wait for the caller to ask for a reconnect.
    async fn idle(&mut self) -> Flow {
        match self.commands.recv().await {
            None => Flow::Exit,
            Some(Command::Send(env)) => {
                self.queue.push_back(env);
                Flow::Continue
            }
            Some(Command::Reconnect) => {
                self.machine.start();
                Flow::Continue
            }
            Some(Command::Disconnect) => {
                self.machine.close();
                Flow::Continue
            }
        }
    }

    async fn attempt(&mut self) -> Flow {
        let connector = self.connector.clone();
        let connect = connector.connect();
        tokio::pin!(connect);

        let result = loop {
            tokio::select! {
                result = &mut connect => break result,
                cmd = self.commands.recv() => match cmd {
                    None => return Flow::Exit,
                    Some(Command::Send(env)) => self.queue.push_back(env),
                    Some(Command::Disconnect) => {
                        self.machine.close();
                        return Flow::Continue;
                    }
                    Some(Command::Reconnect) => {}
                }
            }
        };

        match result {
            Ok(link) => {
                info!(attempts = self.machine.attempts(), "Signaling connected");
                self.machine.on_connected();
                self.publish_state();
                self.events.publish(SignalEvent::Connected);
                match self.session(link).await {
                    Flow::Exit => return Flow::Exit,
                    Flow::Continue => {}
                }
                if self.machine.state() != LinkState::Connected {
                    return Flow::Continue;
                }
            }
            Err(e) => {
                warn!(error = %e, attempt = self.machine.attempts() + 1, "Signaling connect failed");
            }
        }

        self.backoff().await
    }

    /// Pump one established link until it drops or the caller intervenes.
    ///
    /// Returns with the machine still `Connected` when the link was lost.
    async fn session(&mut self, link: Link) -> Flow {
        let Link { tx, mut rx } = link;

        let mut outgoing = Vec::with_capacity(self.queue.len() + 1);
        match Envelope::with_payload(MessageType::Join, &self.identity) {
            Ok(join) => outgoing.push(join),
            Err(e) => warn!(error = %e, "Failed to encode join"),
        }
        outgoing.extend(self.queue.drain(..));
        if !outgoing.is_empty() {
            debug!(count = outgoing.len(), "Flushing queued envelopes");
        }
        for env in outgoing {
            if let Err(env) = transmit(&tx, env) {
                self.queue.push_back(env);
            }
        }

        let start = Instant::now() + self.ping_interval;
        let mut ping = interval_at(start, self.ping_interval);

        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(text) => self.dispatch(&text),
                    None => break,
                },
                cmd = self.commands.recv() => match cmd {
                    None => return Flow::Exit,
                    Some(Command::Send(env)) => {
                        if let Err(env) = transmit(&tx, env) {
                            self.queue.push_back(env);
                            break;
                        }
                    }
                    Some(Command::Disconnect) => {
                        info!("Signaling disconnected by request");
                        self.machine.close();
                        self.events.publish(SignalEvent::Disconnected);
                        return Flow::Continue;
                    }
                    Some(Command::Reconnect) => {
                        self.machine.start();
                        self.events.publish(SignalEvent::Disconnected);
                        return Flow::Continue;
                    }
                },
                _ = ping.tick() => {
                    let _ = transmit(&tx, Envelope::new(MessageType::Ping));
                }
            }
        }

        info!("Signaling link lost");
        self.events.publish(SignalEvent::Disconnected);
        Flow::Continue
    }

    /// Wait out the backoff delay, or give up if the budget is spent.
    async fn backoff(&mut self) -> Flow {
        let Some(delay) = self.machine.on_failure() else {
            if self.machine.state() != LinkState::Closed {
                warn!(attempts = self.machine.attempts(), "Giving up on signaling reconnect");
            }
            return Flow::Continue;
        };
        self.publish_state();
        debug!(delay_ms = delay.as_millis() as u64, attempt = self.machine.attempts(), "Reconnecting after delay");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = self.commands.recv() => match cmd {
                    None => return Flow::Exit,
                    Some(Command::Send(env)) => self.queue.push_back(env),
                    Some(Command::Disconnect) => {
                        self.machine.close();
                        return Flow::Continue;
                    }
                    Some(Command::Reconnect) => {
                        self.machine.start();
                        return Flow::Continue;
                    }
                }
            }
        }
        self.machine.retry();
        Flow::Continue
    }

    fn dispatch(&self, text: &str) {
        for env in Envelope::decode_batch(text) {
            let event = env.and_then(|env| decode_event(&env));
            match event {
                Ok(Some(event)) => self.events.publish(event),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Ignoring malformed signaling message"),
            }
        }
    }
}

/// Encode and hand an envelope to the link. Gives it back if the link is
/// gone so it can be queued.
fn transmit(tx: &mpsc::UnboundedSender<String>, env: Envelope) -> Result<(), Envelope> {
    let text = match env.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, kind = ?env.kind, "Dropping unencodable envelope");
            return Ok(());
        }
    };
    tx.send(text).map_err(|_| env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Switchboard;

    fn identity(name: &str) -> JoinPayload {
        JoinPayload {
            name: name.into(),
            platform: "test".into(),
        }
    }

    fn fast_config(max_attempts: u32) -> SignalingConfig {
        SignalingConfig {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                max_attempts,
            },
            ping_interval: Duration::from_secs(25),
        }
    }

    async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<SignalEvent>, mut f: F) -> SignalEvent
    where
        F: FnMut(&SignalEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ev = rx.recv().await.expect("event stream ended");
                if f(&ev) {
                    return ev;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[test]
    fn test_decode_relayed_event() {
        let env = Envelope::decode(
            r#"{"type":"transfer-response","peerId":"a","payload":{"transferId":"t","accepted":true}}"#,
        )
        .unwrap();
        match decode_event(&env).unwrap() {
            Some(SignalEvent::TransferResponse { from, response }) => {
                assert_eq!(from, "a");
                assert!(response.accepted);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_ignores_pong_and_unknown() {
        assert!(decode_event(&Envelope::new(MessageType::Pong)).unwrap().is_none());
        let env = Envelope::decode(r#"{"type":"mystery"}"#).unwrap();
        assert!(decode_event(&env).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_join_sent_then_peers_received() {
        let board = Switchboard::new();
        let _a = SignalingChannel::spawn(board.connector("a"), identity("A"), fast_config(10));
        board.wait_joined("a").await;

        let b = SignalingChannel::spawn(board.connector("b"), identity("B"), fast_config(10));
        let mut events = b.subscribe();
        let ev = next_matching(&mut events, |e| matches!(e, SignalEvent::Peers(_))).await;
        match ev {
            SignalEvent::Peers(peers) => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].name, "A");
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_queued_messages_flushed_after_reconnect() {
        let board = Switchboard::new();
        let a = SignalingChannel::spawn(board.connector("a"), identity("A"), fast_config(10));
        let b = SignalingChannel::spawn(board.connector("b"), identity("B"), fast_config(10));
        board.wait_joined("a").await;
        board.wait_joined("b").await;
        let mut b_events = b.subscribe();

        board.set_offline("a", true);
        board.kick("a");
        a.wait_for(LinkState::Disconnected).await.unwrap();

        for i in 0..3 {
            let env = Envelope::with_payload(
                MessageType::TransferResponse,
                &TransferResponsePayload {
                    transfer_id: format!("t{i}"),
                    accepted: true,
                },
            )
            .unwrap()
            .to("b");
            a.send(env).unwrap();
        }

        board.set_offline("a", false);
        a.wait_for(LinkState::Connected).await.unwrap();

        let mut ids = Vec::new();
        while ids.len() < 3 {
            if let SignalEvent::TransferResponse { from, response } =
                next_matching(&mut b_events, |e| matches!(e, SignalEvent::TransferResponse { .. })).await
            {
                assert_eq!(from, "a");
                ids.push(response.transfer_id);
            }
        }
        assert_eq!(ids, vec!["t0", "t1", "t2"]);

        // join precedes the flushed traffic on the new link
        let sent = board.sent_by("a");
        let rejoin = sent.iter().rposition(|e| e.kind == MessageType::Join).unwrap();
        let first_flushed = sent.iter().position(|e| e.kind == MessageType::TransferResponse).unwrap();
        assert!(rejoin < first_flushed);
    }

    #[tokio::test]
    async fn test_gives_up_then_explicit_reconnect() {
        let board = Switchboard::new();
        board.set_offline("a", true);
        let a = SignalingChannel::spawn(board.connector("a"), identity("A"), fast_config(3));

        tokio::time::timeout(Duration::from_secs(5), async {
            while board.connect_attempts("a") < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        a.wait_for(LinkState::Disconnected).await.unwrap();

        // budget spent: no further attempts on its own
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(board.connect_attempts("a"), 4);

        board.set_offline("a", false);
        a.reconnect();
        a.wait_for(LinkState::Connected).await.unwrap();
    }

    #[tokio::test]
    async fn test_explicit_disconnect_does_not_reconnect() {
        let board = Switchboard::new();
        let a = SignalingChannel::spawn(board.connector("a"), identity("A"), fast_config(10));
        a.wait_for(LinkState::Connected).await.unwrap();

        a.disconnect();
        a.wait_for(LinkState::Closed).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(board.connect_attempts("a"), 1);
        assert_eq!(a.state(), LinkState::Closed);
    }
}
