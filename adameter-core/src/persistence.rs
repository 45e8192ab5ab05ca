//! On-device persistence of a replica.
//!
//! Each local replica lives in one file:
//! ```text
//! <DATA_DIR>/
//!   adameter.automerge
//!   adameter-epoch-2.automerge
//!   adameter-test.automerge
//! ```
//!
//! Writes go to a temp file that is renamed over the target, so a crash
//! mid-write leaves the previous copy intact.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::replica::{Origin, Replica, ReplicaEvent};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("store {0} has been destroyed")]
    Destroyed(String),
}

struct AutoSave {
    stop: oneshot::Sender<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

/// Keeps one replica in sync with its file.
pub struct LocalPersister {
    name: String,
    path: PathBuf,
    replica: Replica,
    auto_save: Mutex<Option<AutoSave>>,
    destroyed: AtomicBool,
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PersistenceError {
    let path = path.to_path_buf();
    move |source| PersistenceError::Io { path, source }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    }

    let temp_path = path.with_extension("automerge.tmp");
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(bytes).await.map_err(io_err(&temp_path))?;
    file.sync_all().await.map_err(io_err(&temp_path))?;
    drop(file);

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(io_err(path))
}

async fn save_replica(replica: &Replica, path: &Path) {
    match write_atomic(path, &replica.save()).await {
        Ok(()) => tracing::debug!("Saved replica to {}", path.display()),
        Err(e) => tracing::warn!("Failed to save replica: {}", e),
    }
}

impl LocalPersister {
    /// Attaches `replica` to the store named `name` inside `data_dir`.
    /// Nothing is read until [`load`](Self::load).
    pub fn open(data_dir: &Path, name: &str, replica: Replica) -> Self {
        Self {
            name: name.to_string(),
            path: data_dir.join(format!("{}.automerge", name)),
            replica,
            auto_save: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merges the stored document into the replica.
    ///
    /// Returns whether anything was loaded. A missing, unreadable or corrupt
    /// file leaves the replica as it was.
    pub async fn load(&self) -> bool {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No stored replica at {}", self.path.display());
                return false;
            }
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", self.path.display(), e);
                return false;
            }
        };

        match self.replica.load_incremental(&bytes, Origin::Persistence) {
            Ok(applied) => {
                tracing::info!("Loaded {} ({} changes)", self.name, applied);
                true
            }
            Err(e) => {
                tracing::warn!("Stored replica {} is corrupt, starting empty: {}", self.name, e);
                false
            }
        }
    }

    /// Writes the replica to disk now.
    pub async fn save_now(&self) -> Result<(), PersistenceError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(PersistenceError::Destroyed(self.name.clone()));
        }
        write_atomic(&self.path, &self.replica.save()).await
    }

    pub fn is_auto_saving(&self) -> bool {
        self.auto_save
            .lock()
            .map(|auto_save| auto_save.is_some())
            .unwrap_or(false)
    }

    /// Saves after every burst of changes once `debounce` passes without a
    /// further change. Must be called from within a Tokio runtime.
    pub fn start_auto_save(&self, debounce: Duration) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let mut auto_save = self.auto_save.lock().unwrap_or_else(|e| e.into_inner());
        if auto_save.is_some() {
            return;
        }

        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(auto_save_loop(
            self.replica.clone(),
            self.replica.subscribe(),
            self.path.clone(),
            debounce,
            stop_rx,
        ));
        *auto_save = Some(AutoSave { stop, handle });
        tracing::debug!("Auto-save started for {} ({:?})", self.name, debounce);
    }

    /// Stops auto-saving, writing any change still waiting for its debounce.
    pub async fn stop_auto_save(&self) {
        let auto_save = self
            .auto_save
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(auto_save) = auto_save else {
            return;
        };

        let (ack, ack_rx) = oneshot::channel();
        if auto_save.stop.send(ack).is_ok() {
            let _ = ack_rx.await;
        }
        let _ = auto_save.handle.await;
        tracing::debug!("Auto-save stopped for {}", self.name);
    }

    /// Stops auto-saving and refuses further writes. Safe to call repeatedly.
    pub async fn destroy(&self) {
        self.stop_auto_save().await;
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Drains queued events, returning whether any of them needs saving.
fn drain(events: &mut broadcast::Receiver<ReplicaEvent>) -> bool {
    let mut changed = false;
    loop {
        match events.try_recv() {
            Ok(event) => changed |= event.origin != Origin::Persistence,
            Err(TryRecvError::Lagged(_)) => changed = true,
            Err(_) => return changed,
        }
    }
}

async fn auto_save_loop(
    replica: Replica,
    mut events: broadcast::Receiver<ReplicaEvent>,
    path: PathBuf,
    debounce: Duration,
    mut stop: oneshot::Receiver<oneshot::Sender<()>>,
) {
    let mut dirty = false;
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            biased;
            ack = &mut stop => {
                if dirty | drain(&mut events) {
                    save_replica(&replica, &path).await;
                }
                if let Ok(ack) = ack {
                    let _ = ack.send(());
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) if event.origin == Origin::Persistence => {}
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    dirty = true;
                    deadline = Instant::now() + debounce;
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::time::sleep_until(deadline), if dirty => {
                dirty = false;
                save_replica(&replica, &path).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{json, NodeKey};
    use serde_json::json;
    use tempfile::TempDir;

    fn push(replica: &Replica, id: &str) {
        replica
            .change(Origin::Binding(1), NodeKey::Events, |doc, obj| {
                Ok(json::list_push(doc, obj, &json!({"id": id, "date": "2024-01-01"}))?)
            })
            .unwrap();
    }

    fn test_persister(temp_dir: &TempDir) -> (LocalPersister, Replica) {
        let replica = Replica::new().unwrap();
        let persister = LocalPersister::open(temp_dir.path(), "adameter", replica.clone());
        (persister, replica)
    }

    #[tokio::test]
    async fn test_load_missing_store_leaves_replica_empty() {
        let temp_dir = TempDir::new().unwrap();
        let (persister, replica) = test_persister(&temp_dir);
        assert!(!persister.load().await);
        assert!(replica.is_empty().unwrap());
        assert_eq!(
            persister.path(),
            temp_dir.path().join("adameter.automerge").as_path()
        );
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let (persister, replica) = test_persister(&temp_dir);
        push(&replica, "e1");
        persister.save_now().await.unwrap();

        let (reopened, fresh) = test_persister(&temp_dir);
        assert!(reopened.load().await);
        assert_eq!(fresh.read_node(NodeKey::Events).unwrap()[0]["id"], "e1");
    }

    #[tokio::test]
    async fn test_corrupt_store_degrades_to_empty() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("adameter.automerge"), b"garbage").unwrap();

        let (persister, replica) = test_persister(&temp_dir);
        assert!(!persister.load().await);
        assert!(replica.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_auto_save_is_debounced() {
        let temp_dir = TempDir::new().unwrap();
        let (persister, replica) = test_persister(&temp_dir);
        persister.start_auto_save(Duration::from_millis(50));

        push(&replica, "e1");
        push(&replica, "e2");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(persister.path().exists());

        let (reopened, fresh) = test_persister(&temp_dir);
        reopened.load().await;
        assert_eq!(
            fresh.read_node(NodeKey::Events).unwrap().as_array().unwrap().len(),
            2
        );
        persister.destroy().await;
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_change() {
        let temp_dir = TempDir::new().unwrap();
        let (persister, replica) = test_persister(&temp_dir);
        persister.start_auto_save(Duration::from_secs(60));
        assert!(persister.is_auto_saving());

        push(&replica, "e1");
        tokio::task::yield_now().await;
        persister.stop_auto_save().await;
        assert!(!persister.is_auto_saving());
        assert!(persister.path().exists());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let (persister, _replica) = test_persister(&temp_dir);
        persister.start_auto_save(DEFAULT_DEBOUNCE);
        persister.destroy().await;
        persister.destroy().await;

        assert!(matches!(
            persister.save_now().await,
            Err(PersistenceError::Destroyed(_))
        ));
        persister.start_auto_save(DEFAULT_DEBOUNCE);
        assert!(!persister.is_auto_saving());
    }
}
