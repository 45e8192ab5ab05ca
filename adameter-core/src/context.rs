//! Process-wide application context.
//!
//! One [`AppContext`] is opened at startup and shut down before exit. It
//! owns everything that lives for the whole process: the flat settings
//! store, the device id, the replica with its bound collections, the local
//! persister for the current mode and epoch, the snapshot store and the sync
//! session, if any.
//!
//! Switching mode or epoch swaps the local replica: the old store is flushed
//! and closed, the replica is emptied and the store for the new selection is
//! loaded and rebound.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::collections::Collections;
use crate::identity::get_device_id;
use crate::kv::{FileKvStore, KeyValueStore, KvError, MemoryKvStore};
use crate::persistence::{LocalPersister, PersistenceError, DEFAULT_DEBOUNCE};
use crate::replica::bridge::{BindingSet, BridgeError};
use crate::replica::{self, Origin, Replica, ReplicaError};
use crate::room::{self, Mode};
use crate::settings::{RoomSelection, SyncSettings};
use crate::snapshot::{EpochSnapshot, SnapshotError, SnapshotStore};
use crate::sync::{
    JoinMode, JoinStrategy, RelayConnector, SessionConfig, SessionHandle, SyncError, SyncSession,
};

/// Settings file inside the data directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Effective room this device has already reconciled with.
pub const BOOTSTRAPPED_ROOM_KEY: &str = "adameter-bootstrapped-room-v1";

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("No room set. Join one with: ada room join <room>")]
    NoRoom,
    #[error("I/O error for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub data_dir: PathBuf,
    pub autosave_debounce: Duration,
}

impl ContextOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            autosave_debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_autosave_debounce(mut self, debounce: Duration) -> Self {
        self.autosave_debounce = debounce;
        self
    }
}

pub struct AppContext {
    options: ContextOptions,
    store: Arc<dyn KeyValueStore>,
    settings: SyncSettings,
    device_id: String,
    replica: Replica,
    collections: Arc<Collections>,
    bindings: BindingSet,
    persister: LocalPersister,
    snapshots: SnapshotStore,
    session: Option<SessionHandle>,
}

/// Loads the local store for (`mode`, `epoch`) into `replica`, binds the
/// collections and applies any snapshot parked for that epoch.
async fn open_local(
    options: &ContextOptions,
    replica: &Replica,
    collections: &Collections,
    snapshots: &SnapshotStore,
    mode: Mode,
    epoch: u32,
) -> Result<(LocalPersister, BindingSet), ContextError> {
    let name = room::persistence_name(epoch, mode);
    let persister = LocalPersister::open(&options.data_dir, &name, replica.clone());
    persister.load().await;

    let bindings = collections.bind_all(replica)?;

    if let Some(snapshot) = snapshots.consume(mode, epoch).await {
        tracing::info!(
            "Carrying {} records into {} epoch {}",
            snapshot.record_count(),
            mode,
            epoch
        );
        snapshot.apply(collections);
        bindings.flush().await;
        if let Err(e) = persister.save_now().await {
            tracing::warn!("Failed to save restored snapshot: {}", e);
        }
    }

    persister.start_auto_save(options.autosave_debounce);
    Ok((persister, bindings))
}

impl AppContext {
    /// Opens the context rooted at `options.data_dir`.
    ///
    /// An unusable settings file degrades to in-memory settings.
    pub async fn open(options: ContextOptions) -> Result<Self, ContextError> {
        tokio::fs::create_dir_all(&options.data_dir)
            .await
            .map_err(|source| ContextError::Io {
                path: options.data_dir.clone(),
                source,
            })?;

        let store: Arc<dyn KeyValueStore> =
            match FileKvStore::open(options.data_dir.join(SETTINGS_FILE)) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    tracing::warn!("Settings store unavailable, using memory: {}", e);
                    Arc::new(MemoryKvStore::new())
                }
            };
        let snapshots = SnapshotStore::open(&options.data_dir, store.clone()).await;
        Self::with_parts(options, store, snapshots).await
    }

    /// Opens the context over an explicit settings store and snapshot store.
    pub async fn with_parts(
        options: ContextOptions,
        store: Arc<dyn KeyValueStore>,
        snapshots: SnapshotStore,
    ) -> Result<Self, ContextError> {
        let device_id = get_device_id(Some(store.as_ref()));
        let settings = SyncSettings::new(store.clone());
        // Runs the legacy room migration before mode and epoch are read.
        if let Err(e) = settings.stored_base_room() {
            tracing::warn!("Failed to read stored room: {}", e);
        }

        let replica = Replica::new()?;
        let collections = Arc::new(Collections::new());
        let mode = settings.mode();
        let epoch = settings.epoch(mode);
        let (persister, bindings) =
            open_local(&options, &replica, &collections, &snapshots, mode, epoch).await?;

        tracing::info!(
            "Opened {} (device {}, {} epoch {})",
            persister.name(),
            device_id,
            mode,
            epoch
        );

        Ok(Self {
            options,
            store,
            settings,
            device_id,
            replica,
            collections,
            bindings,
            persister,
            snapshots,
            session: None,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn data_dir(&self) -> &Path {
        &self.options.data_dir
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    /// Name of the local store currently loaded.
    pub fn local_store_name(&self) -> &str {
        self.persister.name()
    }

    pub fn effective_room(&self) -> Result<Option<String>, ContextError> {
        Ok(self.settings.effective_room()?)
    }

    /// Effective room this device already reconciled with, if any.
    pub fn bootstrapped_room(&self) -> Option<String> {
        match self.store.get(BOOTSTRAPPED_ROOM_KEY) {
            Ok(room) => room,
            Err(e) => {
                tracing::warn!("Failed to read bootstrap marker: {}", e);
                None
            }
        }
    }

    /// Writes every pending local change through to disk.
    pub async fn flush(&self) -> Result<(), ContextError> {
        self.bindings.flush().await;
        self.persister.save_now().await?;
        Ok(())
    }

    async fn stop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.teardown().await;
        }
    }

    /// Swaps the replica over to the store for the current mode and epoch.
    async fn reopen_local(&mut self) -> Result<(), ContextError> {
        self.stop_session().await;
        self.bindings.flush().await;
        self.bindings.unbind();
        self.persister.destroy().await;

        self.replica
            .replace(replica::new_document()?, Origin::Persistence)?;

        let mode = self.settings.mode();
        let epoch = self.settings.epoch(mode);
        let (persister, bindings) = open_local(
            &self.options,
            &self.replica,
            &self.collections,
            &self.snapshots,
            mode,
            epoch,
        )
        .await?;
        self.persister = persister;
        self.bindings = bindings;
        tracing::info!("Switched to {}", self.persister.name());
        Ok(())
    }

    /// Keeps the legacy room key in step after a mode or epoch change.
    fn rewrite_room(&self) -> Result<(), ContextError> {
        if let Some(base) = self.settings.stored_base_room()? {
            let mode = self.settings.mode();
            self.settings
                .set_stored_base_room(Some(&base), self.settings.epoch(mode), mode)?;
        }
        Ok(())
    }

    /// Switches between production and test data.
    pub async fn set_mode(&mut self, mode: Mode) -> Result<(), ContextError> {
        if self.settings.mode() == mode {
            return Ok(());
        }
        self.stop_session().await;
        self.settings.set_mode(mode)?;
        self.rewrite_room()?;
        self.reopen_local().await
    }

    /// Sets the room from user input and starts syncing with it.
    ///
    /// Input carrying an epoch suffix also selects that mode and epoch. With
    /// no `strategy`, a room this device already reconciled with is resumed
    /// and any other room is joined preferring the room's data.
    pub async fn join_room(
        &mut self,
        input: &str,
        strategy: Option<JoinStrategy>,
        connector: Arc<dyn RelayConnector>,
    ) -> Result<SessionHandle, ContextError> {
        self.select_room(input).await?;
        self.connect(strategy, connector).await
    }

    /// Stores the room from user input without connecting.
    ///
    /// Input carrying an epoch suffix also switches to that mode and epoch,
    /// reopening the local replica.
    pub async fn select_room(&mut self, input: &str) -> Result<RoomSelection, ContextError> {
        let selection = self.settings.resolve_room_input(input);
        if selection.base.is_empty() {
            return Err(ContextError::NoRoom);
        }

        let mode = self.settings.mode();
        if selection.mode != mode || selection.epoch != self.settings.epoch(selection.mode) {
            self.stop_session().await;
            self.settings.set_mode(selection.mode)?;
            self.settings.set_epoch(selection.epoch, selection.mode)?;
            self.reopen_local().await?;
        }
        self.settings
            .set_stored_base_room(Some(&selection.base), selection.epoch, selection.mode)?;
        tracing::info!("Room set to {}", selection.effective_room());
        Ok(selection)
    }

    /// Starts syncing with the stored room.
    pub async fn connect(
        &mut self,
        strategy: Option<JoinStrategy>,
        connector: Arc<dyn RelayConnector>,
    ) -> Result<SessionHandle, ContextError> {
        let room = self.effective_room()?.ok_or(ContextError::NoRoom)?;
        self.stop_session().await;
        self.bindings.flush().await;

        let join = match strategy {
            Some(strategy) => JoinMode::Bootstrap(strategy),
            None if self.bootstrapped_room().as_deref() == Some(room.as_str()) => JoinMode::Resume,
            None => JoinMode::Bootstrap(JoinStrategy::default()),
        };

        let store = self.store.clone();
        let marker = room.clone();
        let config = SessionConfig::new(room, join, self.device_id.clone()).on_bootstrapped(
            move |decision| {
                if let Err(e) = store.set(BOOTSTRAPPED_ROOM_KEY, &marker) {
                    tracing::warn!("Failed to record bootstrap of {}: {}", marker, e);
                }
                tracing::debug!("Recorded bootstrap of {} ({})", marker, decision);
            },
        );

        let session = SyncSession::start(config, self.replica.clone(), connector);
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Stops syncing and forgets the room. Local data is kept.
    pub async fn leave_room(&mut self) -> Result<(), ContextError> {
        self.stop_session().await;
        let mode = self.settings.mode();
        self.settings
            .set_stored_base_room(None, self.settings.epoch(mode), mode)?;
        self.store.remove(BOOTSTRAPPED_ROOM_KEY)?;
        tracing::info!("Left room");
        Ok(())
    }

    /// Moves to the next epoch of the current mode, carrying the current data
    /// along. Returns the new epoch.
    ///
    /// The data is parked as a snapshot for the new epoch first; if that
    /// fails the epoch is left unchanged.
    pub async fn reset_epoch(&mut self) -> Result<u32, ContextError> {
        let mode = self.settings.mode();
        let next = self.settings.epoch(mode).saturating_add(1);

        self.stop_session().await;
        self.bindings.flush().await;
        let snapshot = EpochSnapshot::capture(&self.collections);
        self.snapshots.save(&snapshot, mode, next).await?;

        self.settings.set_epoch(next, mode)?;
        self.rewrite_room()?;
        self.reopen_local().await?;

        tracing::info!("Reset {} to epoch {}", mode, next);
        Ok(next)
    }

    /// Stops syncing and writes everything out.
    pub async fn shutdown(&mut self) {
        self.stop_session().await;
        self.bindings.flush().await;
        self.bindings.unbind();
        self.persister.destroy().await;
        tracing::debug!("Context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Breast, FeedingSession};
    use crate::sync::testing::MockRelay;
    use crate::sync::{BootstrapDecision, SessionState};
    use chrono::Utc;
    use tempfile::TempDir;

    async fn test_context(temp_dir: &TempDir) -> AppContext {
        AppContext::open(
            ContextOptions::new(temp_dir.path()).with_autosave_debounce(Duration::from_millis(10)),
        )
        .await
        .unwrap()
    }

    fn session(id: &str) -> FeedingSession {
        let now = Utc::now();
        FeedingSession::new(Breast::Left, now, now).with_id(id)
    }

    async fn wait_syncing(handle: &SessionHandle) {
        tokio::time::timeout(Duration::from_secs(5), handle.wait_for(SessionState::Syncing))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_fresh() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = test_context(&temp_dir).await;
        assert!(!ctx.device_id().is_empty());
        assert_eq!(ctx.local_store_name(), "adameter");
        assert!(ctx.collections().is_empty());
        assert_eq!(ctx.effective_room().unwrap(), None);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_records_survive_restart() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = test_context(&temp_dir).await;
        let device_id = ctx.device_id().to_string();
        ctx.collections().feeding_sessions.push(session("s1"));
        ctx.shutdown().await;

        let mut reopened = test_context(&temp_dir).await;
        assert_eq!(reopened.device_id(), device_id);
        assert!(reopened.collections().feeding_sessions.get("s1").is_some());
        reopened.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_epoch_carries_data() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = test_context(&temp_dir).await;
        ctx.collections().feeding_sessions.push(session("s1"));

        assert_eq!(ctx.reset_epoch().await.unwrap(), 1);
        assert_eq!(ctx.settings().epoch(Mode::Production), 1);
        assert_eq!(ctx.local_store_name(), "adameter-epoch-1");
        assert!(ctx.collections().feeding_sessions.get("s1").is_some());
        assert!(ctx.snapshots().consume(Mode::Production, 1).await.is_none());

        ctx.shutdown().await;
        assert!(temp_dir.path().join("adameter-epoch-1.automerge").exists());
    }

    #[tokio::test]
    async fn test_reset_epoch_without_snapshot_storage_keeps_epoch() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = AppContext::with_parts(
            ContextOptions::new(temp_dir.path()),
            Arc::new(MemoryKvStore::new()),
            SnapshotStore::disabled(),
        )
        .await
        .unwrap();
        ctx.collections().feeding_sessions.push(session("s1"));

        assert!(matches!(
            ctx.reset_epoch().await,
            Err(ContextError::Snapshot(SnapshotError::Unavailable))
        ));
        assert_eq!(ctx.settings().epoch(Mode::Production), 0);
        assert_eq!(ctx.local_store_name(), "adameter");
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_room_bootstraps_once() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = test_context(&temp_dir).await;
        ctx.collections().feeding_sessions.push(session("s1"));
        let relay = MockRelay::new();

        let handle = ctx
            .join_room("family", None, Arc::new(relay.clone()))
            .await
            .unwrap();
        wait_syncing(&handle).await;
        assert_eq!(handle.room(), "family");
        assert_eq!(handle.last_decision(), Some(BootstrapDecision::RestoreLocal));
        assert_eq!(ctx.bootstrapped_room().as_deref(), Some("family"));
        assert_eq!(relay.saves(), 1);

        let resumed = ctx.connect(None, Arc::new(relay.clone())).await.unwrap();
        wait_syncing(&resumed).await;
        assert_eq!(resumed.last_decision(), None);
        assert_eq!(relay.saves(), 1);
        assert!(handle.is_torn_down());

        ctx.leave_room().await.unwrap();
        assert_eq!(ctx.effective_room().unwrap(), None);
        assert_eq!(ctx.bootstrapped_room(), None);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_room_with_epoch_suffix_switches_store() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = test_context(&temp_dir).await;
        let relay = MockRelay::new();

        let handle = ctx
            .join_room("family__test-epoch__2", None, Arc::new(relay))
            .await
            .unwrap();
        assert_eq!(handle.room(), "family__test-epoch__2");
        assert_eq!(ctx.settings().mode(), Mode::Test);
        assert_eq!(ctx.settings().epoch(Mode::Test), 2);
        assert_eq!(ctx.local_store_name(), "adameter-test-epoch-2");
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_mode_swaps_replica() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = test_context(&temp_dir).await;
        ctx.collections().feeding_sessions.push(session("prod"));

        ctx.set_mode(Mode::Test).await.unwrap();
        assert_eq!(ctx.local_store_name(), "adameter-test");
        assert!(ctx.collections().feeding_sessions.is_empty());

        ctx.set_mode(Mode::Production).await.unwrap();
        assert!(ctx.collections().feeding_sessions.get("prod").is_some());
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_without_room_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = test_context(&temp_dir).await;
        assert!(matches!(
            ctx.connect(None, Arc::new(MockRelay::new())).await,
            Err(ContextError::NoRoom)
        ));
        ctx.shutdown().await;
    }
}
