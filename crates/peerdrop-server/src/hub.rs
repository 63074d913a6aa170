use std::collections::HashMap;
use std::sync::Arc;

use rand::RngCore;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use peerdrop_shared::protocol::Envelope;
use peerdrop_shared::PeerInfo;

use crate::error::HubError;
use crate::room::{auto_room_id, generate_room_code, Room, RoomKind};

/// Opaque session identity (16 random bytes, hex).
pub type SessionId = String;

/// Live counters exposed on `/api/stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub sessions: usize,
    pub auto_rooms: usize,
    pub coded_rooms: usize,
}

struct SessionEntry {
    info: PeerInfo,
    addr: String,
    /// Only the hub holds this sender; dropping it closes the outbound pump
    tx: mpsc::Sender<String>,
    auto_room: Option<String>,
    coded_room: Option<String>,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<SessionId, SessionEntry>,
    auto_rooms: HashMap<String, Room>,
    coded_rooms: HashMap<String, Room>,
}

impl HubState {
    /// Non-blocking enqueue. A full queue drops the message.
    fn send(&self, to: &str, msg: &str) -> bool {
        let Some(entry) = self.sessions.get(to) else {
            return false;
        };
        match entry.tx.try_send(msg.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %to, "Outbound queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session = %to, "Outbound queue closed");
                false
            }
        }
    }

    fn broadcast(&self, room: &Room, exclude: &str, msg: &str) {
        for member in room.others(exclude) {
            self.send(member, msg);
        }
    }

    fn peer_infos(&self, room: &Room, exclude: &str) -> Vec<PeerInfo> {
        room.others(exclude)
            .filter_map(|id| self.sessions.get(id).map(|s| s.info.clone()))
            .collect()
    }

    fn rooms_mut(&mut self, kind: RoomKind) -> &mut HashMap<String, Room> {
        match kind {
            RoomKind::Auto => &mut self.auto_rooms,
            RoomKind::Coded => &mut self.coded_rooms,
        }
    }

    /// Remove `session` from a room, tell the remaining members, drop the
    /// room once empty.
    fn leave_room(&mut self, kind: RoomKind, room_id: &str, session: &str) -> Result<(), HubError> {
        let rooms = self.rooms_mut(kind);
        let Some(room) = rooms.get_mut(room_id) else {
            return Ok(());
        };
        room.remove(session);
        if room.is_empty() {
            rooms.remove(room_id);
            debug!(room = %room_id, ?kind, "Removed empty room");
            return Ok(());
        }

        let msg = Envelope::peer_left(session)?.encode()?;
        let rooms = match kind {
            RoomKind::Auto => &self.auto_rooms,
            RoomKind::Coded => &self.coded_rooms,
        };
        if let Some(room) = rooms.get(room_id) {
            self.broadcast(room, session, &msg);
        }
        Ok(())
    }

    fn leave_coded(&mut self, session: &str) -> Result<Option<String>, HubError> {
        let Some(code) = self
            .sessions
            .get_mut(session)
            .and_then(|entry| entry.coded_room.take())
        else {
            return Ok(None);
        };
        self.leave_room(RoomKind::Coded, &code, session)?;
        Ok(Some(code))
    }

    fn leave_auto(&mut self, session: &str) -> Result<(), HubError> {
        if let Some(room_id) = self
            .sessions
            .get_mut(session)
            .and_then(|entry| entry.auto_room.take())
        {
            self.leave_room(RoomKind::Auto, &room_id, session)?;
        }
        Ok(())
    }

    /// Add `session` to a room: the joiner gets `welcome` built from the
    /// current peer list. With `announce`, the rest get `peer-joined`.
    fn enter_room(
        &mut self,
        kind: RoomKind,
        room_id: &str,
        session: &str,
        announce: bool,
        welcome: impl FnOnce(Vec<PeerInfo>) -> Result<Envelope, HubError>,
    ) -> Result<(), HubError> {
        let info = self
            .sessions
            .get(session)
            .map(|s| s.info.clone())
            .ok_or_else(|| HubError::UnknownSession(session.to_string()))?;

        self.rooms_mut(kind)
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id, kind))
            .add(session);

        let rooms = match kind {
            RoomKind::Auto => &self.auto_rooms,
            RoomKind::Coded => &self.coded_rooms,
        };
        let Some(room) = rooms.get(room_id) else {
            return Ok(());
        };

        let welcome = welcome(self.peer_infos(room, session))?.encode()?;
        self.send(session, &welcome);
        if announce {
            let joined = Envelope::peer_joined(info)?.encode()?;
            self.broadcast(room, session, &joined);
        }
        Ok(())
    }
}

/// Central switchboard: owns the session table and both room tables.
///
/// The lock is held only for table lookups and mutations. Delivery is a
/// `try_send` into the target's bounded queue, so nothing here waits on a
/// socket.
#[derive(Clone)]
pub struct Hub {
    state: Arc<RwLock<HubState>>,
    queue_capacity: usize,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(HubState::default())),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a freshly connected session. The returned receiver is the
    /// session's outbound queue.
    pub async fn register(&self, addr: impl Into<String>) -> (SessionId, mpsc::Receiver<String>) {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let id = hex::encode(bytes);

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let addr = addr.into();
        let entry = SessionEntry {
            info: PeerInfo {
                id: id.clone(),
                name: String::new(),
                platform: String::new(),
            },
            addr: addr.clone(),
            tx,
            auto_room: None,
            coded_room: None,
        };
        self.state.write().await.sessions.insert(id.clone(), entry);

        info!(session = %id, addr = %addr, "Session registered");
        (id, rx)
    }

    /// Drop a session from every room and from the session table.
    ///
    /// Safe to call more than once, and for sessions that never sent `join`.
    pub async fn unregister(&self, id: &str) {
        let mut state = self.state.write().await;
        if !state.sessions.contains_key(id) {
            return;
        }
        if let Err(e) = state.leave_auto(id) {
            warn!(session = %id, error = %e, "Failed to announce departure");
        }
        if let Err(e) = state.leave_coded(id) {
            warn!(session = %id, error = %e, "Failed to announce departure");
        }
        state.sessions.remove(id);
        info!(session = %id, "Session unregistered");
    }

    /// Attach the declared name/platform and join the auto-scope room derived
    /// from the session's address. Returns the room id.
    pub async fn join(&self, id: &str, name: String, platform: String) -> Result<String, HubError> {
        let mut state = self.state.write().await;
        let entry = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| HubError::UnknownSession(id.to_string()))?;
        entry.info.name = name;
        entry.info.platform = platform;
        let room_id = auto_room_id(&entry.addr);

        // A repeated join re-announces the session with its new details
        state.leave_auto(id)?;

        state.enter_room(RoomKind::Auto, &room_id, id, true, |peers| {
            Ok(Envelope::peers(peers)?)
        })?;
        if let Some(entry) = state.sessions.get_mut(id) {
            entry.auto_room = Some(room_id.clone());
        }

        info!(session = %id, room = %room_id, "Joined auto-scope room");
        Ok(room_id)
    }

    /// Create a coded room with a fresh, non-colliding code and put the
    /// requester in it. Replies with `room-created`.
    pub async fn create_coded_room(&self, id: &str) -> Result<String, HubError> {
        self.create_coded_room_with(id, || generate_room_code(&mut rand::thread_rng()))
            .await
    }

    /// As [`Hub::create_coded_room`], drawing candidate codes from `next_code`.
    pub async fn create_coded_room_with(
        &self,
        id: &str,
        mut next_code: impl FnMut() -> String,
    ) -> Result<String, HubError> {
        let mut state = self.state.write().await;
        if !state.sessions.contains_key(id) {
            return Err(HubError::UnknownSession(id.to_string()));
        }

        let code = loop {
            let candidate = next_code();
            if !state.coded_rooms.contains_key(&candidate) {
                break candidate;
            }
            debug!(code = %candidate, "Room code collision, retrying");
        };

        state.leave_coded(id)?;

        let mut room = Room::new(code.clone(), RoomKind::Coded);
        room.add(id);
        state.coded_rooms.insert(code.clone(), room);
        if let Some(entry) = state.sessions.get_mut(id) {
            entry.coded_room = Some(code.clone());
        }

        let msg = Envelope::room_created(code.clone())?.encode()?;
        state.send(id, &msg);

        info!(session = %id, room = %code, "Coded room created");
        Ok(code)
    }

    /// Join an existing coded room. Leaves any other coded room first.
    /// An unknown code never creates a room.
    pub async fn join_coded_room(&self, id: &str, code: &str) -> Result<(), HubError> {
        let mut state = self.state.write().await;
        if !state.sessions.contains_key(id) {
            return Err(HubError::UnknownSession(id.to_string()));
        }
        if !state.coded_rooms.contains_key(code) {
            return Err(HubError::RoomNotFound(code.to_string()));
        }

        let already_member = state
            .sessions
            .get(id)
            .and_then(|s| s.coded_room.as_deref())
            == Some(code);
        if !already_member {
            state.leave_coded(id)?;
        }

        // Members already know a session that is re-joining
        state.enter_room(RoomKind::Coded, code, id, !already_member, |peers| {
            Ok(Envelope::room_joined(code, peers)?)
        })?;
        if let Some(entry) = state.sessions.get_mut(id) {
            entry.coded_room = Some(code.to_string());
        }

        info!(session = %id, room = %code, "Joined coded room");
        Ok(())
    }

    /// Leave the session's coded room, if any. The leaver gets `room-left`.
    pub async fn leave_coded_room(&self, id: &str) -> Result<Option<String>, HubError> {
        let mut state = self.state.write().await;
        let left = state.leave_coded(id)?;
        if let Some(code) = &left {
            let msg = Envelope::room_left(code.clone())?.encode()?;
            state.send(id, &msg);
            info!(session = %id, room = %code, "Left coded room");
        }
        Ok(left)
    }

    /// Forward a directed envelope to `envelope.target_id`.
    ///
    /// The sender's auto-scope room is searched before its coded room; the
    /// first room containing the target wins. The envelope is stamped with
    /// the sender id and its payload is passed through untouched. Returns
    /// whether the message was queued.
    pub async fn relay(&self, from: &str, mut envelope: Envelope) -> bool {
        let Some(target) = envelope.target_id.clone() else {
            debug!(session = %from, kind = ?envelope.kind, "Relay without target");
            return false;
        };
        envelope.peer_id = Some(from.to_string());

        let state = self.state.read().await;
        let Some(sender) = state.sessions.get(from) else {
            return false;
        };

        let shared = [
            sender
                .auto_room
                .as_ref()
                .and_then(|r| state.auto_rooms.get(r)),
            sender
                .coded_room
                .as_ref()
                .and_then(|r| state.coded_rooms.get(r)),
        ]
        .into_iter()
        .flatten()
        .any(|room| room.contains(&target));

        if !shared {
            debug!(session = %from, target = %target, "Relay target not found");
            return false;
        }

        match envelope.encode() {
            Ok(msg) => state.send(&target, &msg),
            Err(e) => {
                warn!(session = %from, error = %e, "Failed to encode relayed message");
                false
            }
        }
    }

    /// Queue an envelope for one session.
    pub async fn enqueue(&self, id: &str, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Ok(msg) => self.state.read().await.send(id, &msg),
            Err(e) => {
                warn!(session = %id, error = %e, "Failed to encode message");
                false
            }
        }
    }

    /// Remove rooms whose membership reached zero without being cleaned up.
    pub async fn sweep_empty_rooms(&self) -> usize {
        let mut state = self.state.write().await;
        let before = state.auto_rooms.len() + state.coded_rooms.len();
        let keep = |_: &String, room: &mut Room| {
            if room.is_empty() {
                debug!(room = %room.id, kind = ?room.kind, "Sweeping empty room");
            }
            !room.is_empty()
        };
        state.auto_rooms.retain(keep);
        state.coded_rooms.retain(keep);
        let removed = before - (state.auto_rooms.len() + state.coded_rooms.len());
        if removed > 0 {
            debug!(removed, "Swept empty rooms");
        }
        removed
    }

    pub async fn stats(&self) -> HubStats {
        let state = self.state.read().await;
        HubStats {
            sessions: state.sessions.len(),
            auto_rooms: state.auto_rooms.len(),
            coded_rooms: state.coded_rooms.len(),
        }
    }

    #[cfg(test)]
    async fn insert_empty_room(&self, kind: RoomKind, id: &str) {
        self.state
            .write()
            .await
            .rooms_mut(kind)
            .insert(id.to_string(), Room::new(id, kind));
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(peerdrop_shared::constants::SEND_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop_shared::protocol::{
        MessageType, PeerJoinedPayload, PeerLeftPayload, PeersPayload, RoomCodePayload,
        RoomJoinedPayload,
    };

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(Envelope::decode(&msg).unwrap());
        }
        out
    }

    async fn joined(hub: &Hub, addr: &str, name: &str) -> (SessionId, mpsc::Receiver<String>) {
        let (id, rx) = hub.register(addr).await;
        hub.join(&id, name.into(), "linux".into()).await.unwrap();
        (id, rx)
    }

    fn offer_to(target: &str) -> Envelope {
        Envelope::decode(&format!(
            r#"{{"type":"offer","targetId":"{target}","payload":{{"sdp":"v=0","type":"offer"}}}}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_session_ids_are_unique_hex() {
        let hub = Hub::default();
        let (a, _ra) = hub.register("10.0.0.1:1").await;
        let (b, _rb) = hub.register("10.0.0.1:2").await;
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_join_auto_room_announces() {
        let hub = Hub::default();
        let (a, mut ra) = joined(&hub, "192.168.1.10:5000", "alpha").await;
        let first = drain(&mut ra);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, MessageType::Peers);
        assert!(first[0].payload_as::<PeersPayload>().unwrap().peers.is_empty());

        let (b, mut rb) = joined(&hub, "192.168.1.22:5000", "beta").await;
        let to_b = drain(&mut rb);
        let peers = to_b[0].payload_as::<PeersPayload>().unwrap().peers;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, a);
        assert_eq!(peers[0].name, "alpha");

        let to_a = drain(&mut ra);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0].kind, MessageType::PeerJoined);
        assert_eq!(to_a[0].payload_as::<PeerJoinedPayload>().unwrap().peer.id, b);

        assert_eq!(hub.stats().await.auto_rooms, 1);
    }

    #[tokio::test]
    async fn test_relay_stays_within_shared_room() {
        let hub = Hub::default();
        let (a, _ra) = joined(&hub, "192.168.1.10:1", "a").await;
        let (b, mut rb) = joined(&hub, "192.168.1.11:1", "b").await;
        let (c, mut rc) = joined(&hub, "10.9.9.9:1", "c").await;
        drain(&mut rb);
        drain(&mut rc);

        assert!(hub.relay(&a, offer_to(&b)).await);
        let got = drain(&mut rb);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageType::Offer);
        assert_eq!(got[0].peer_id.as_deref(), Some(a.as_str()));
        assert_eq!(
            got[0].payload.as_ref().unwrap().get(),
            r#"{"sdp":"v=0","type":"offer"}"#
        );
        assert!(drain(&mut rc).is_empty());

        // c is in a different auto room and shares no coded room with a
        assert!(!hub.relay(&a, offer_to(&c)).await);
        assert!(drain(&mut rc).is_empty());
    }

    #[tokio::test]
    async fn test_relay_through_coded_room() {
        let hub = Hub::default();
        let (a, mut ra) = joined(&hub, "192.168.1.10:1", "a").await;
        let (c, mut rc) = joined(&hub, "10.9.9.9:1", "c").await;

        let code = hub.create_coded_room(&a).await.unwrap();
        hub.join_coded_room(&c, &code).await.unwrap();
        drain(&mut ra);
        drain(&mut rc);

        assert!(hub.relay(&a, offer_to(&c)).await);
        assert_eq!(drain(&mut rc).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_code_creates_nothing() {
        let hub = Hub::default();
        let (a, _ra) = joined(&hub, "192.168.1.10:1", "a").await;
        let err = hub.join_coded_room(&a, "ZZZZZ").await.unwrap_err();
        assert!(matches!(err, HubError::RoomNotFound(_)));
        assert_eq!(err.to_string(), "room not found");
        assert_eq!(hub.stats().await.coded_rooms, 0);
    }

    #[tokio::test]
    async fn test_room_code_collision_retries() {
        let hub = Hub::default();
        let (a, _ra) = joined(&hub, "192.168.1.10:1", "a").await;
        let (b, _rb) = joined(&hub, "192.168.1.11:1", "b").await;

        let first = hub
            .create_coded_room_with(&a, || "AB12C".to_string())
            .await
            .unwrap();
        assert_eq!(first, "AB12C");

        let mut candidates = vec!["XYZ23".to_string(), "AB12C".to_string()];
        let second = hub
            .create_coded_room_with(&b, || candidates.pop().unwrap())
            .await
            .unwrap();
        assert_eq!(second, "XYZ23");
        assert_eq!(hub.stats().await.coded_rooms, 2);
    }

    #[tokio::test]
    async fn test_join_coded_room_switches_rooms() {
        let hub = Hub::default();
        let (a, mut ra) = joined(&hub, "10.0.0.1:1", "a").await;
        let (b, mut rb) = joined(&hub, "10.1.0.1:1", "b").await;
        let (c, mut rc) = joined(&hub, "10.2.0.1:1", "c").await;

        let first = hub.create_coded_room(&a).await.unwrap();
        hub.join_coded_room(&b, &first).await.unwrap();
        let second = hub.create_coded_room(&c).await.unwrap();
        drain(&mut ra);
        drain(&mut rb);
        drain(&mut rc);

        hub.join_coded_room(&b, &second).await.unwrap();

        let to_a = drain(&mut ra);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0].kind, MessageType::PeerLeft);
        assert_eq!(to_a[0].payload_as::<PeerLeftPayload>().unwrap().peer_id, b);

        let to_b = drain(&mut rb);
        assert_eq!(to_b[0].kind, MessageType::RoomJoined);
        let joined = to_b[0].payload_as::<RoomJoinedPayload>().unwrap();
        assert_eq!(joined.code, second);
        assert_eq!(joined.peers.len(), 1);
        assert_eq!(joined.peers[0].id, c);

        assert_eq!(drain(&mut rc)[0].kind, MessageType::PeerJoined);
    }

    #[tokio::test]
    async fn test_rejoining_current_room_is_not_announced() {
        let hub = Hub::default();
        let (a, mut ra) = joined(&hub, "10.0.0.1:1", "a").await;
        let (b, mut rb) = joined(&hub, "10.1.0.1:1", "b").await;
        let code = hub.create_coded_room(&a).await.unwrap();
        hub.join_coded_room(&b, &code).await.unwrap();
        drain(&mut ra);
        drain(&mut rb);

        hub.join_coded_room(&b, &code).await.unwrap();

        assert!(drain(&mut ra).is_empty());
        let to_b = drain(&mut rb);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].kind, MessageType::RoomJoined);
        let joined = to_b[0].payload_as::<RoomJoinedPayload>().unwrap();
        assert_eq!(joined.peers.len(), 1);
        assert_eq!(joined.peers[0].id, a);
    }

    #[tokio::test]
    async fn test_leave_coded_room() {
        let hub = Hub::default();
        let (a, mut ra) = joined(&hub, "10.0.0.1:1", "a").await;
        let code = hub.create_coded_room(&a).await.unwrap();
        drain(&mut ra);

        assert_eq!(hub.leave_coded_room(&a).await.unwrap(), Some(code.clone()));
        let got = drain(&mut ra);
        assert_eq!(got[0].kind, MessageType::RoomLeft);
        assert_eq!(got[0].payload_as::<RoomCodePayload>().unwrap().code, code);
        assert_eq!(hub.stats().await.coded_rooms, 0);

        // No-op the second time
        assert_eq!(hub.leave_coded_room(&a).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = Hub::default();
        let (a, mut ra) = joined(&hub, "10.0.0.1:1", "a").await;
        let (b, _rb) = joined(&hub, "10.0.0.2:1", "b").await;
        let (never_joined, _rn) = hub.register("10.0.0.3:1").await;
        drain(&mut ra);

        hub.unregister(&b).await;
        hub.unregister(&b).await;
        hub.unregister(&never_joined).await;

        let got = drain(&mut ra);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageType::PeerLeft);

        hub.unregister(&a).await;
        assert_eq!(hub.stats().await, HubStats::default());
        // Outbound queue released
        assert!(ra.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_empty_rooms() {
        let hub = Hub::default();
        hub.insert_empty_room(RoomKind::Auto, "10.0.0").await;
        hub.insert_empty_room(RoomKind::Coded, "QWERT").await;
        let (_a, _ra) = joined(&hub, "10.5.5.5:1", "a").await;

        assert_eq!(hub.sweep_empty_rooms().await, 2);
        let stats = hub.stats().await;
        assert_eq!(stats.auto_rooms, 1);
        assert_eq!(stats.coded_rooms, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let hub = Hub::new(1);
        let (a, _ra) = joined(&hub, "10.0.0.1:1", "a").await;
        let (b, mut rb) = joined(&hub, "10.0.0.2:1", "b").await;
        // rb already holds its `peers` message, so the queue is full

        assert!(!hub.relay(&a, offer_to(&b)).await);
        let got = drain(&mut rb);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageType::Peers);
    }
}
