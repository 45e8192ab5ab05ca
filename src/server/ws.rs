//! WebSocket handler for `/rooms/{room}`.
//!
//! A connection must open with `join` for the room in its path. The relay
//! answers `peer` and from then on exchanges `sync` messages with the client
//! against the shared room document, keeping one sync state per connection.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use automerge::sync;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use adameter_core::sync::{RelayMessage, RELAY_PEER_ID};

use super::hub::{Room, RoomHub};

/// How long a new connection has to send `join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn room_handler(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    State(hub): State<Arc<RoomHub>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, room, hub))
}

async fn send(socket: &mut WebSocket, msg: &RelayMessage) -> Result<(), String> {
    let encoded = msg.encode().map_err(|e| e.to_string())?;
    socket
        .send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| e.to_string())
}

async fn send_error(socket: &mut WebSocket, message: String) {
    let _ = send(socket, &RelayMessage::Error { message }).await;
    let _ = socket.send(Message::Close(None)).await;
}

/// Waits for the client's `join` and returns its peer id.
async fn await_join(socket: &mut WebSocket, room: &str) -> Result<String, String> {
    let joined = tokio::time::timeout(JOIN_TIMEOUT, async {
        while let Some(frame) = socket.recv().await {
            match frame.map_err(|e| e.to_string())? {
                Message::Binary(data) => {
                    return match RelayMessage::decode(&data).map_err(|e| e.to_string())? {
                        RelayMessage::Join { sender_id, room: joined } if joined == room => {
                            Ok(sender_id)
                        }
                        RelayMessage::Join { room: joined, .. } => Err(format!(
                            "Joined room {} on a connection for {}",
                            joined, room
                        )),
                        other => Err(format!("Expected join, got {:?}", other)),
                    };
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err("Connection closed before join".to_string())
    })
    .await;

    joined.map_err(|_| "Timed out waiting for join".to_string())?
}

/// Sends our next sync message for the peer, if there is one.
async fn push(
    socket: &mut WebSocket,
    room: &Room,
    state: &mut sync::State,
) -> Result<(), String> {
    if let Some(data) = room.generate(state).await {
        send(
            socket,
            &RelayMessage::Sync {
                room: room.name().to_string(),
                data,
            },
        )
        .await?;
    }
    Ok(())
}

async fn handle_socket(mut socket: WebSocket, room_name: String, hub: Arc<RoomHub>) {
    if let Err(e) = super::RoomStorage::validate_room(&room_name) {
        send_error(&mut socket, e.to_string()).await;
        return;
    }

    let peer_id = match await_join(&mut socket, &room_name).await {
        Ok(peer_id) => peer_id,
        Err(e) => {
            tracing::debug!("Rejected connection to {}: {}", room_name, e);
            send_error(&mut socket, e).await;
            return;
        }
    };

    let (room, mut updates) = match hub.join(&room_name).await {
        Ok(joined) => joined,
        Err(e) => {
            tracing::warn!("Failed to open room {}: {}", room_name, e);
            send_error(&mut socket, format!("Failed to open room: {}", e)).await;
            return;
        }
    };

    let peer = RelayMessage::Peer {
        sender_id: RELAY_PEER_ID.to_string(),
        target_id: peer_id.clone(),
    };
    let connection = hub.connection_id();
    tracing::info!("Peer {} joined {} (connection {})", peer_id, room_name, connection);

    if let Err(e) = send(&mut socket, &peer).await {
        tracing::debug!("Failed to answer join from {}: {}", peer_id, e);
    } else if let Err(e) = serve(&mut socket, &room, &mut updates, connection).await {
        tracing::warn!("Connection {} to {} failed: {}", connection, room_name, e);
    }

    drop(updates);
    hub.release(&room).await;
    tracing::info!("Peer {} left {}", peer_id, room_name);
}

async fn serve(
    socket: &mut WebSocket,
    room: &Room,
    updates: &mut tokio::sync::broadcast::Receiver<u64>,
    connection: u64,
) -> Result<(), String> {
    let mut state = sync::State::new();

    loop {
        tokio::select! {
            frame = socket.recv() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                match frame.map_err(|e| e.to_string())? {
                    Message::Binary(data) => {
                        match RelayMessage::decode(&data).map_err(|e| e.to_string())? {
                            RelayMessage::Sync { room: target, data } if target == room.name() => {
                                room.receive(&mut state, &data, connection).await?;
                                push(socket, room, &mut state).await?;
                            }
                            RelayMessage::Sync { room: target, .. } => {
                                return Err(format!("Sync for foreign room {}", target));
                            }
                            RelayMessage::Leave { .. } => return Ok(()),
                            other => {
                                tracing::debug!("Ignoring {:?} on connection {}", other, connection);
                            }
                        }
                    }
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
            update = updates.recv() => match update {
                Ok(from) if from == connection => {}
                Ok(_) | Err(RecvError::Lagged(_)) => push(socket, room, &mut state).await?,
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{app, RoomStorage};
    use super::*;
    use adameter_core::replica::{json, NodeKey, Origin, Replica};
    use adameter_core::sync::{bootstrap, BootstrapDecision, CancelToken, JoinStrategy};
    use adameter_core::sync::{RelayConnector, RemotePersister, WsConnector};
    use serde_json::json;
    use tempfile::TempDir;

    async fn start_relay(temp_dir: &TempDir) -> String {
        let hub = Arc::new(RoomHub::new(RoomStorage::new(temp_dir.path())));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(hub)).await.unwrap();
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_devices_share_records_through_relay() {
        let temp_dir = TempDir::new().unwrap();
        let relay_url = start_relay(&temp_dir).await;
        let connector = WsConnector::new(relay_url);

        let first = Replica::new().unwrap();
        first
            .change(Origin::Binding(1), NodeKey::Events, |doc, obj| {
                Ok(json::list_push(
                    doc,
                    obj,
                    &json!({"id": "e1", "date": "2024-03-01", "title": "First smile"}),
                )?)
            })
            .unwrap();

        let mut remote = connector.connect("family").await.unwrap();
        let decision = bootstrap(
            &first,
            remote.as_mut(),
            JoinStrategy::PreferRemote,
            "device-1",
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(decision, BootstrapDecision::RestoreLocal);
        remote.close().await;
        assert!(temp_dir.path().join("family.automerge").exists());

        let second = Replica::new().unwrap();
        let mut remote = connector.connect("family").await.unwrap();
        let decision = bootstrap(
            &second,
            remote.as_mut(),
            JoinStrategy::PreferRemote,
            "device-2",
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(decision, BootstrapDecision::AcceptRemote);
        remote.close().await;

        let events = second.read_node(NodeKey::Events).unwrap();
        assert_eq!(events[0]["id"], "e1");
    }

    #[tokio::test]
    async fn test_join_for_other_room_is_rejected() {
        use adameter_core::sync::build_ws_url;
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let temp_dir = TempDir::new().unwrap();
        let relay_url = start_relay(&temp_dir).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(build_ws_url(&relay_url, "family"))
            .await
            .unwrap();

        let join = RelayMessage::Join {
            sender_id: "peer".to_string(),
            room: "elsewhere".to_string(),
        };
        ws.send(WsMessage::Binary(join.encode().unwrap().into()))
            .await
            .unwrap();

        let reply = loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Binary(data) => break RelayMessage::decode(&data).unwrap(),
                _ => continue,
            }
        };
        assert!(matches!(reply, RelayMessage::Error { .. }));
    }
}
