//! In-process stand-in for the signaling hub.
//!
//! Every agent is placed in one shared room; relayed messages are stamped
//! with the sender and routed by `targetId`, like the real hub does.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use peerdrop_shared::protocol::JoinPayload;
use peerdrop_shared::{Envelope, MessageType, PeerInfo};

use crate::error::SignalingError;
use crate::signaling::{Connector, Link};

struct Client {
    conn: u64,
    tx: mpsc::UnboundedSender<String>,
    info: Option<PeerInfo>,
}

#[derive(Default)]
struct Board {
    clients: HashMap<String, Client>,
    offline: HashSet<String>,
    attempts: HashMap<String, usize>,
    sent: HashMap<String, Vec<Envelope>>,
    next_conn: u64,
}

impl Board {
    fn deliver(&self, to: &str, env: &Envelope) {
        if let (Some(client), Ok(text)) = (self.clients.get(to), env.encode()) {
            let _ = client.tx.send(text);
        }
    }

    fn joined_others(&self, exclude: &str) -> Vec<PeerInfo> {
        self.clients
            .iter()
            .filter(|(id, _)| id.as_str() != exclude)
            .filter_map(|(_, c)| c.info.clone())
            .collect()
    }

    fn handle(&mut self, id: &str, text: &str) {
        let Ok(mut env) = Envelope::decode(text) else {
            return;
        };
        self.sent.entry(id.to_string()).or_default().push(env.clone());

        match env.kind {
            MessageType::Join => {
                let Ok(join) = env.payload_as::<JoinPayload>() else {
                    return;
                };
                let info = PeerInfo {
                    id: id.to_string(),
                    name: join.name,
                    platform: join.platform,
                };
                if let Some(client) = self.clients.get_mut(id) {
                    client.info = Some(info.clone());
                }
                if let Ok(peers) = Envelope::peers(self.joined_others(id)) {
                    self.deliver(id, &peers);
                }
                if let Ok(joined) = Envelope::peer_joined(info) {
                    for other in self.joined_others(id) {
                        self.deliver(&other.id, &joined);
                    }
                }
            }
            MessageType::Ping => self.deliver(id, &Envelope::pong()),
            kind if kind.is_relayed() => {
                let Some(target) = env.target_id.clone() else {
                    return;
                };
                env.peer_id = Some(id.to_string());
                self.deliver(&target, &env);
            }
            _ => {}
        }
    }

    fn remove(&mut self, id: &str, conn: u64) {
        let current = self.clients.get(id).map(|c| c.conn);
        if current != Some(conn) {
            return;
        }
        self.clients.remove(id);
        if let Ok(left) = Envelope::peer_left(id) {
            for other in self.joined_others(id) {
                self.deliver(&other.id, &left);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct Switchboard {
    inner: Arc<Mutex<Board>>,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that registers as session `id` on every connect.
    pub fn connector(&self, id: &str) -> Arc<dyn Connector> {
        Arc::new(SwitchConnector {
            id: id.to_string(),
            board: self.clone(),
        })
    }

    pub fn set_offline(&self, id: &str, offline: bool) {
        let mut board = self.inner.lock().unwrap();
        if offline {
            board.offline.insert(id.to_string());
        } else {
            board.offline.remove(id);
        }
    }

    /// Drop the session's current link from the hub side.
    pub fn kick(&self, id: &str) {
        let mut board = self.inner.lock().unwrap();
        if let Some(client) = board.clients.get(id) {
            let conn = client.conn;
            board.remove(id, conn);
        }
    }

    pub fn connect_attempts(&self, id: &str) -> usize {
        self.inner.lock().unwrap().attempts.get(id).copied().unwrap_or(0)
    }

    /// Every envelope `id` has sent, across all of its connections.
    pub fn sent_by(&self, id: &str) -> Vec<Envelope> {
        self.inner.lock().unwrap().sent.get(id).cloned().unwrap_or_default()
    }

    pub fn sent_of(&self, id: &str, kind: MessageType) -> Vec<Envelope> {
        self.sent_by(id).into_iter().filter(|e| e.kind == kind).collect()
    }

    pub async fn wait_joined(&self, id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let joined = self
                    .inner
                    .lock()
                    .unwrap()
                    .clients
                    .get(id)
                    .is_some_and(|c| c.info.is_some());
                if joined {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("peer never joined");
    }
}

struct SwitchConnector {
    id: String,
    board: Switchboard,
}

#[async_trait]
impl Connector for SwitchConnector {
    async fn connect(&self) -> Result<Link, SignalingError> {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let conn = {
            let mut board = self.board.inner.lock().unwrap();
            *board.attempts.entry(self.id.clone()).or_default() += 1;
            if board.offline.contains(&self.id) {
                return Err(SignalingError::Connect("offline".into()));
            }
            board.next_conn += 1;
            let conn = board.next_conn;
            board.clients.insert(
                self.id.clone(),
                Client {
                    conn,
                    tx: in_tx,
                    info: None,
                },
            );
            conn
        };

        let id = self.id.clone();
        let board = self.board.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                board.inner.lock().unwrap().handle(&id, &text);
            }
            board.inner.lock().unwrap().remove(&id, conn);
        });

        Ok(Link {
            tx: out_tx,
            rx: in_rx,
        })
    }
}
