//! WebSocket client for the adameter relay.
//!
//! One connection serves one room. The client performs the join/peer
//! handshake, then exchanges Automerge sync messages for the room document.
//! A single sync state is kept for the lifetime of the connection, so a
//! document loaded through [`RemotePersister::load`] and later adopted by the
//! replica keeps syncing incrementally.

use std::time::Duration;

use async_trait::async_trait;
use automerge::sync::{Message as SyncMessage, State as SyncState, SyncDoc};
use automerge::AutoCommit;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::error::SyncError;
use super::protocol::{generate_peer_id, RelayMessage};
use super::transport::{CancelToken, RelayConnector, RemotePersister};
use crate::replica::{self, Origin, Replica};

/// Timeout for handshake completion.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long to wait for any activity before treating an exchange as done.
const DOC_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Response from the relay's /health endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayHealth {
    pub status: String,
    pub version: String,
}

/// Something the sync protocol can run against: a detached document or the
/// live replica.
trait SyncTarget {
    fn generate(&mut self, state: &mut SyncState) -> Option<SyncMessage>;
    fn receive(&mut self, state: &mut SyncState, message: SyncMessage) -> Result<(), SyncError>;
}

impl SyncTarget for AutoCommit {
    fn generate(&mut self, state: &mut SyncState) -> Option<SyncMessage> {
        self.sync().generate_sync_message(state)
    }

    fn receive(&mut self, state: &mut SyncState, message: SyncMessage) -> Result<(), SyncError> {
        self.sync()
            .receive_sync_message(state, message)
            .map_err(|e| SyncError::Protocol(e.to_string()))
    }
}

impl SyncTarget for &Replica {
    fn generate(&mut self, state: &mut SyncState) -> Option<SyncMessage> {
        self.generate_sync_message(state)
    }

    fn receive(&mut self, state: &mut SyncState, message: SyncMessage) -> Result<(), SyncError> {
        self.receive_sync_message(state, message, Origin::Remote)?;
        Ok(())
    }
}

/// Builds the WebSocket URL for a room.
pub fn build_ws_url(relay_url: &str, room: &str) -> String {
    // Convert http(s) to ws(s) if needed
    let base_url = if let Some(rest) = relay_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = relay_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if !relay_url.starts_with("ws://") && !relay_url.starts_with("wss://") {
        format!("ws://{}", relay_url)
    } else {
        relay_url.to_string()
    };

    format!("{}/rooms/{}", base_url.trim_end_matches('/'), room)
}

/// Builds an HTTP URL for a given path.
pub fn build_http_url(relay_url: &str, path: &str) -> String {
    // Convert ws(s) to http(s) if needed
    let base_url = if let Some(rest) = relay_url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if let Some(rest) = relay_url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if !relay_url.starts_with("http://") && !relay_url.starts_with("https://") {
        format!("http://{}", relay_url)
    } else {
        relay_url.to_string()
    };

    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Probes the relay's /health endpoint.
pub async fn check_relay(relay_url: &str) -> Result<RelayHealth, SyncError> {
    let response = reqwest::Client::new()
        .get(build_http_url(relay_url, "/health"))
        .timeout(HANDSHAKE_TIMEOUT)
        .send()
        .await
        .map_err(|e| SyncError::Http(e.to_string()))?;

    if !response.status().is_success() {
        return Err(SyncError::Http(format!(
            "Relay returned status {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| SyncError::Http(e.to_string()))
}

/// Connects to rooms on a relay over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    relay_url: String,
}

impl WsConnector {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }
}

#[async_trait]
impl RelayConnector for WsConnector {
    async fn connect(&self, room: &str) -> Result<Box<dyn RemotePersister>, SyncError> {
        let ws_url = build_ws_url(&self.relay_url, room);
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;

        let (sender, receiver) = ws_stream.split();
        let mut persister = WsPersister {
            room: room.to_string(),
            peer_id: generate_peer_id(),
            sender,
            receiver,
            state: SyncState::new(),
            closed: false,
        };
        persister.perform_handshake().await?;
        tracing::debug!("Joined room {} as {}", room, persister.peer_id);
        Ok(Box::new(persister))
    }
}

/// A joined room on the relay.
pub struct WsPersister {
    room: String,
    peer_id: String,
    sender: SplitSink<WsStream, Message>,
    receiver: SplitStream<WsStream>,
    state: SyncState,
    closed: bool,
}

impl WsPersister {
    async fn send(&mut self, msg: &RelayMessage) -> Result<(), SyncError> {
        let encoded = msg.encode().map_err(|e| SyncError::Cbor(e.to_string()))?;
        self.sender
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|e| SyncError::WebSocket(e.to_string()))
    }

    /// Sends `join` and waits for the relay's `peer` answer.
    async fn perform_handshake(&mut self) -> Result<(), SyncError> {
        let join = RelayMessage::Join {
            sender_id: self.peer_id.clone(),
            room: self.room.clone(),
        };
        self.send(&join).await?;

        let peer_id = self.peer_id.clone();
        let receiver = &mut self.receiver;
        let answer = timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(msg_result) = receiver.next().await {
                match msg_result {
                    Ok(Message::Binary(data)) => {
                        let msg = RelayMessage::decode(&data)
                            .map_err(|e| SyncError::Cbor(e.to_string()))?;
                        return match msg {
                            RelayMessage::Peer { target_id, .. } if target_id == peer_id => Ok(()),
                            RelayMessage::Peer { .. } => Err(SyncError::Handshake(
                                "Peer response target_id mismatch".to_string(),
                            )),
                            RelayMessage::Error { message } => Err(SyncError::Handshake(message)),
                            other => Err(SyncError::Handshake(format!(
                                "Unexpected message during handshake: {:?}",
                                other
                            ))),
                        };
                    }
                    Ok(Message::Close(_)) => {
                        return Err(SyncError::Handshake(
                            "Relay closed connection during handshake".to_string(),
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(SyncError::WebSocket(e.to_string())),
                }
            }
            Err(SyncError::Handshake(
                "Connection closed before handshake completed".to_string(),
            ))
        })
        .await;

        match answer {
            Ok(result) => result,
            Err(_) => Err(SyncError::HandshakeTimeout),
        }
    }

    /// Sends our next sync message for `target`, if there is one.
    async fn push<T: SyncTarget>(&mut self, target: &mut T) -> Result<bool, SyncError> {
        match target.generate(&mut self.state) {
            Some(message) => {
                let msg = RelayMessage::Sync {
                    room: self.room.clone(),
                    data: message.encode(),
                };
                self.send(&msg).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Handles one inbound frame. Returns `Ok(true)` if it was a sync message.
    async fn handle_frame<T: SyncTarget>(
        &mut self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        target: &mut T,
    ) -> Result<bool, SyncError> {
        match frame {
            Some(Ok(Message::Binary(data))) => {
                let msg = RelayMessage::decode(&data).map_err(|e| SyncError::Cbor(e.to_string()))?;
                match msg {
                    RelayMessage::Sync { room, data } if room == self.room => {
                        let message = SyncMessage::decode(&data)
                            .map_err(|e| SyncError::Protocol(e.to_string()))?;
                        target.receive(&mut self.state, message)?;
                        Ok(true)
                    }
                    RelayMessage::Error { message } => Err(SyncError::Relay(message)),
                    _ => Ok(false),
                }
            }
            Some(Ok(Message::Ping(data))) => {
                self.sender
                    .send(Message::Pong(data))
                    .await
                    .map_err(|e| SyncError::WebSocket(e.to_string()))?;
                Ok(false)
            }
            Some(Ok(Message::Close(_))) | None => {
                self.closed = true;
                Err(SyncError::Disconnected)
            }
            Some(Ok(_)) => Ok(false),
            Some(Err(e)) => Err(SyncError::WebSocket(e.to_string())),
        }
    }

    /// Exchanges sync messages for `target` until neither side has anything
    /// more to say.
    async fn exchange<T: SyncTarget>(&mut self, target: &mut T) -> Result<usize, SyncError> {
        let mut rounds = 0;
        if self.push(target).await? {
            rounds += 1;
        }

        loop {
            let frame = match timeout(DOC_IDLE_TIMEOUT, self.receiver.next()).await {
                Ok(frame) => frame,
                // No activity during idle window - assume sync complete
                Err(_) => break,
            };
            if self.handle_frame(frame, target).await? {
                if self.push(target).await? {
                    rounds += 1;
                } else {
                    break;
                }
            }
        }
        Ok(rounds)
    }
}

#[async_trait]
impl RemotePersister for WsPersister {
    async fn load(&mut self) -> Result<AutoCommit, SyncError> {
        let mut doc = replica::new_document()?;
        let rounds = self.exchange(&mut doc).await?;
        tracing::debug!("Loaded room {} in {} rounds", self.room, rounds);
        Ok(doc)
    }

    async fn save(&mut self, replica: &Replica) -> Result<(), SyncError> {
        let rounds = self.exchange(&mut &*replica).await?;
        tracing::debug!("Saved room {} in {} rounds", self.room, rounds);
        Ok(())
    }

    async fn run(&mut self, replica: &Replica, cancel: &CancelToken) -> Result<(), SyncError> {
        let mut events = replica.subscribe();
        let mut target = replica;
        self.push(&mut target).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Ok(event) if event.origin == Origin::Remote => {}
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        self.push(&mut target).await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                frame = self.receiver.next() => {
                    if self.handle_frame(frame, &mut target).await? {
                        self.push(&mut target).await?;
                        tracing::debug!("Synced room {}", self.room);
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let leave = RelayMessage::Leave {
            sender_id: self.peer_id.clone(),
        };
        let _ = self.send(&leave).await;
        let _ = self.sender.send(Message::Close(None)).await;
    }
}
