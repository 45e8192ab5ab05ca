//! Open rooms and change fan-out.
//!
//! Every connection to a room syncs against the same in-memory document.
//! After a connection applies a change the hub tells the room's other
//! connections, which then generate sync messages for their peers.

use automerge::sync::{self, SyncDoc};
use automerge::AutoCommit;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

use super::storage::{RoomStorage, RoomStorageError};

const UPDATE_CAPACITY: usize = 64;

/// One open room.
pub struct Room {
    name: String,
    doc: Mutex<AutoCommit>,
    storage: RoomStorage,
    /// Carries the id of the connection that changed the document.
    updates: broadcast::Sender<u64>,
}

impl Room {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Applies a peer's sync message. Returns whether the document changed.
    ///
    /// A changed document is saved and announced to the other connections.
    pub async fn receive(
        &self,
        state: &mut sync::State,
        message: &[u8],
        connection: u64,
    ) -> Result<bool, String> {
        let message = sync::Message::decode(message).map_err(|e| e.to_string())?;

        let mut doc = self.doc.lock().await;
        let before = doc.get_heads();
        doc.sync()
            .receive_sync_message(state, message)
            .map_err(|e| e.to_string())?;
        if doc.get_heads() == before {
            return Ok(false);
        }

        if let Err(e) = self.storage.save(&self.name, &mut doc) {
            tracing::warn!("Failed to save room {}: {}", self.name, e);
        }
        drop(doc);

        tracing::debug!("Room {} changed by connection {}", self.name, connection);
        let _ = self.updates.send(connection);
        Ok(true)
    }

    /// Next sync message for a peer, if it is missing anything.
    pub async fn generate(&self, state: &mut sync::State) -> Option<Vec<u8>> {
        let mut doc = self.doc.lock().await;
        let message = doc
            .sync()
            .generate_sync_message(state)
            .map(|message| message.encode());
        message
    }
}

/// All rooms with at least one connection.
pub struct RoomHub {
    storage: RoomStorage,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    next_connection: AtomicU64,
}

impl RoomHub {
    pub fn new(storage: RoomStorage) -> Self {
        Self {
            storage,
            rooms: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Opens `room`, loading it from disk if no connection holds it yet.
    pub async fn join(
        &self,
        room: &str,
    ) -> Result<(Arc<Room>, broadcast::Receiver<u64>), RoomStorageError> {
        let mut rooms = self.rooms.write().await;
        if let Some(open) = rooms.get(room) {
            let updates = open.updates.subscribe();
            return Ok((open.clone(), updates));
        }

        let doc = self.storage.load(room)?.unwrap_or_else(AutoCommit::new);
        let (sender, updates) = broadcast::channel(UPDATE_CAPACITY);
        let open = Arc::new(Room {
            name: room.to_string(),
            doc: Mutex::new(doc),
            storage: self.storage.clone(),
            updates: sender,
        });
        rooms.insert(room.to_string(), open.clone());
        tracing::info!("Opened room {}", room);
        Ok((open, updates))
    }

    /// Closes `room` once its last connection has dropped its receiver.
    pub async fn release(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        let idle = rooms
            .get(room.name())
            .is_some_and(|open| Arc::ptr_eq(open, room) && open.updates.receiver_count() == 0);
        if idle {
            rooms.remove(room.name());
            tracing::info!("Closed room {}", room.name());
        }
    }

    pub async fn open_rooms(&self) -> usize {
        self.rooms.read().await.len()
    }
}
