//! One WebSocket connection bridged to the hub.
//!
//! Each session runs two pumps. The inbound pump decodes envelopes and
//! dispatches them; the outbound pump drains the session's queue, batching
//! whatever is already waiting into one frame, and sends keepalive pings.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use peerdrop_shared::protocol::{Envelope, JoinPayload, MessageType, RoomCodePayload};

use crate::config::ServerConfig;
use crate::error::HubError;
use crate::hub::Hub;

/// Serve one upgraded socket until it closes or goes silent.
pub async fn run(socket: WebSocket, hub: Hub, addr: String, config: Arc<ServerConfig>) {
    let (id, queue) = hub.register(addr).await;
    let (ws_tx, ws_rx) = socket.split();

    let mut send_task = tokio::spawn(outbound_pump(
        ws_tx,
        queue,
        config.ping_interval,
        config.write_wait,
        id.clone(),
    ));

    tokio::select! {
        _ = inbound_pump(ws_rx, &hub, &id, config.pong_wait) => {}
        _ = &mut send_task => {
            debug!(session = %id, "Outbound pump stopped");
        }
    }

    // Dropping the queue sender lets the outbound pump close the socket
    hub.unregister(&id).await;
    if !send_task.is_finished() {
        let _ = send_task.await;
    }
}

async fn inbound_pump(mut ws_rx: SplitStream<WebSocket>, hub: &Hub, id: &str, pong_wait: Duration) {
    loop {
        // Any inbound frame, pongs included, resets the deadline
        let next = match timeout(pong_wait, ws_rx.next()).await {
            Ok(next) => next,
            Err(_) => {
                info!(session = %id, "Read deadline expired, closing session");
                break;
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                for envelope in Envelope::decode_batch(&text) {
                    match envelope {
                        Ok(envelope) => dispatch(hub, id, envelope).await,
                        Err(e) => warn!(session = %id, error = %e, "Dropping malformed message"),
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(session = %id, error = %e, "WebSocket read error");
                break;
            }
        }
    }
}

async fn outbound_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<String>,
    ping_interval: Duration,
    write_wait: Duration,
    id: String,
) {
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(first) = next else {
                    let _ = timeout(write_wait, ws_tx.send(Message::Close(None))).await;
                    break;
                };
                let batch = coalesce(first, &mut queue);
                if !write(&mut ws_tx, Message::Text(batch), write_wait, &id).await {
                    break;
                }
            }
            _ = ping.tick() => {
                if !write(&mut ws_tx, Message::Ping(Vec::new()), write_wait, &id).await {
                    break;
                }
            }
        }
    }
}

/// Join `first` with everything already queued behind it, newline separated.
fn coalesce(first: String, queue: &mut mpsc::Receiver<String>) -> String {
    let mut batch = first;
    while let Ok(next) = queue.try_recv() {
        batch.push('\n');
        batch.push_str(&next);
    }
    batch
}

async fn write(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    write_wait: Duration,
    id: &str,
) -> bool {
    match timeout(write_wait, ws_tx.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(session = %id, error = %e, "WebSocket write failed");
            false
        }
        Err(_) => {
            warn!(session = %id, "WebSocket write timed out");
            false
        }
    }
}

/// Route one decoded envelope from session `id`.
pub async fn dispatch(hub: &Hub, id: &str, envelope: Envelope) {
    match envelope.kind {
        MessageType::Join => match envelope.payload_as::<JoinPayload>() {
            Ok(join) => {
                if let Err(e) = hub.join(id, join.name, join.platform).await {
                    warn!(session = %id, error = %e, "Join failed");
                }
            }
            Err(e) => warn!(session = %id, error = %e, "Invalid join payload"),
        },
        MessageType::CreateRoom => {
            if let Err(e) = hub.create_coded_room(id).await {
                warn!(session = %id, error = %e, "Room creation failed");
            }
        }
        MessageType::JoinRoom => {
            let code = match envelope.payload_as::<RoomCodePayload>() {
                Ok(payload) => payload.code.trim().to_ascii_uppercase(),
                Err(e) => {
                    warn!(session = %id, error = %e, "Invalid join-room payload");
                    return;
                }
            };
            match hub.join_coded_room(id, &code).await {
                Ok(()) => {}
                Err(e @ HubError::RoomNotFound(_)) => {
                    debug!(session = %id, room = %code, "Join of unknown room");
                    match Envelope::room_error(e.to_string()) {
                        Ok(reply) => {
                            hub.enqueue(id, &reply).await;
                        }
                        Err(e) => warn!(session = %id, error = %e, "Failed to build room-error"),
                    }
                }
                Err(e) => warn!(session = %id, error = %e, "Join-room failed"),
            }
        }
        MessageType::LeaveRoom => {
            if let Err(e) = hub.leave_coded_room(id).await {
                warn!(session = %id, error = %e, "Leave-room failed");
            }
        }
        MessageType::Ping => {
            hub.enqueue(id, &Envelope::pong()).await;
        }
        kind if kind.is_relayed() => {
            hub.relay(id, envelope).await;
        }
        kind => {
            debug!(session = %id, ?kind, "Ignoring message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop_shared::protocol::RoomErrorPayload;

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            out.extend(Envelope::decode_batch(&batch).map(|e| e.unwrap()));
        }
        out
    }

    async fn send(hub: &Hub, id: &str, json: &str) {
        dispatch(hub, id, Envelope::decode(json).unwrap()).await;
    }

    #[tokio::test]
    async fn test_ping_answered_directly() {
        let hub = Hub::default();
        let (id, mut rx) = hub.register("10.0.0.1:1").await;
        send(&hub, &id, r#"{"type":"ping"}"#).await;
        let got = drain(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageType::Pong);
    }

    #[tokio::test]
    async fn test_join_then_relay_stamps_sender() {
        let hub = Hub::default();
        let (a, mut ra) = hub.register("10.0.0.1:1").await;
        let (b, mut rb) = hub.register("10.0.0.2:1").await;
        send(&hub, &a, r#"{"type":"join","payload":{"name":"A","platform":"linux"}}"#).await;
        send(&hub, &b, r#"{"type":"join","payload":{"name":"B","platform":"macos"}}"#).await;
        drain(&mut ra);
        drain(&mut rb);

        let request = format!(
            r#"{{"type":"transfer-request","targetId":"{b}","payload":{{"transferId":"t","files":[],"totalSize":0}}}}"#
        );
        send(&hub, &a, &request).await;

        let got = drain(&mut rb);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageType::TransferRequest);
        assert_eq!(got[0].peer_id.as_deref(), Some(a.as_str()));
        assert!(drain(&mut ra).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_room_gets_room_error() {
        let hub = Hub::default();
        let (id, mut rx) = hub.register("10.0.0.1:1").await;
        send(&hub, &id, r#"{"type":"join-room","payload":{"code":"nope9"}}"#).await;
        let got = drain(&mut rx);
        assert_eq!(got[0].kind, MessageType::RoomError);
        assert_eq!(
            got[0].payload_as::<RoomErrorPayload>().unwrap().error,
            "room not found"
        );
        assert_eq!(hub.stats().await.coded_rooms, 0);
    }

    #[tokio::test]
    async fn test_room_code_is_case_insensitive() {
        let hub = Hub::default();
        let (a, _ra) = hub.register("10.0.0.1:1").await;
        let (b, mut rb) = hub.register("10.9.0.1:1").await;
        let code = hub.create_coded_room(&a).await.unwrap();

        let join = format!(
            r#"{{"type":"join-room","payload":{{"code":" {} "}}}}"#,
            code.to_lowercase()
        );
        send(&hub, &b, &join).await;
        assert_eq!(drain(&mut rb)[0].kind, MessageType::RoomJoined);
    }

    #[tokio::test]
    async fn test_unknown_types_ignored() {
        let hub = Hub::default();
        let (id, mut rx) = hub.register("10.0.0.1:1").await;
        send(&hub, &id, r#"{"type":"peers","payload":{"peers":[]}}"#).await;
        send(&hub, &id, r#"{"type":"telepathy"}"#).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_coalesce_joins_queued_messages() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send("b".to_string()).await.unwrap();
        tx.send("c".to_string()).await.unwrap();
        assert_eq!(coalesce("a".to_string(), &mut rx), "a\nb\nc");
        assert_eq!(coalesce("d".to_string(), &mut rx), "d");
    }
}
