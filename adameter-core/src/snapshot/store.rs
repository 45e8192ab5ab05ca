use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use super::EpochSnapshot;
use crate::kv::{KeyValueStore, KvError};
use crate::room::Mode;

/// Prefix of snapshot keys in the flat key-value store.
pub const FLAT_KEY_PREFIX: &str = "adameter-yjs-epoch-snapshot-v1";

const DATABASE_FILE: &str = "snapshots.db";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no snapshot storage is available")]
    Unavailable,
}

/// Identifies the snapshot parked for one epoch of one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotKey {
    pub mode: Mode,
    pub epoch: u32,
}

impl SnapshotKey {
    pub fn new(mode: Mode, epoch: u32) -> Self {
        Self { mode, epoch }
    }

    /// Row key in the structured store.
    pub fn record_key(&self) -> String {
        format!("{}:{}", self.mode, self.epoch)
    }

    /// Key in the flat key-value store.
    pub fn flat_key(&self) -> String {
        format!("{}:{}:{}", FLAT_KEY_PREFIX, self.mode, self.epoch)
    }
}

/// One storage tier of the snapshot chain.
#[async_trait]
pub trait SnapshotTier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn try_save(
        &self,
        key: &SnapshotKey,
        created_at: DateTime<Utc>,
        payload: &str,
    ) -> Result<(), SnapshotError>;

    /// Reads and deletes the payload for `key`.
    async fn try_consume(&self, key: &SnapshotKey) -> Result<Option<String>, SnapshotError>;

    async fn remove(&self, key: &SnapshotKey) -> Result<(), SnapshotError>;
}

/// Snapshots in a SQLite database.
pub struct SqliteSnapshotTier {
    pool: SqlitePool,
}

impl SqliteSnapshotTier {
    /// Opens (creating if needed) the database at `path` and runs migrations.
    pub async fn open(path: &Path) -> Result<Self, SnapshotError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(sqlx::Error::Io)?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&db_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl SnapshotTier for SqliteSnapshotTier {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn try_save(
        &self,
        key: &SnapshotKey,
        created_at: DateTime<Utc>,
        payload: &str,
    ) -> Result<(), SnapshotError> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (key, created_at, payload) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET created_at = excluded.created_at, payload = excluded.payload
            "#,
        )
        .bind(key.record_key())
        .bind(created_at.to_rfc3339())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_consume(&self, key: &SnapshotKey) -> Result<Option<String>, SnapshotError> {
        let record_key = key.record_key();
        let mut tx = self.pool.begin().await?;

        let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM snapshots WHERE key = ?")
            .bind(&record_key)
            .fetch_optional(&mut *tx)
            .await?;

        if row.is_some() {
            sqlx::query("DELETE FROM snapshots WHERE key = ?")
                .bind(&record_key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(row.map(|(payload,)| payload))
    }

    async fn remove(&self, key: &SnapshotKey) -> Result<(), SnapshotError> {
        sqlx::query("DELETE FROM snapshots WHERE key = ?")
            .bind(key.record_key())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Snapshots as plain entries of the flat key-value store.
pub struct FlatSnapshotTier {
    store: Arc<dyn KeyValueStore>,
}

impl FlatSnapshotTier {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SnapshotTier for FlatSnapshotTier {
    fn name(&self) -> &'static str {
        "flat"
    }

    async fn try_save(
        &self,
        key: &SnapshotKey,
        _created_at: DateTime<Utc>,
        payload: &str,
    ) -> Result<(), SnapshotError> {
        Ok(self.store.set(&key.flat_key(), payload)?)
    }

    async fn try_consume(&self, key: &SnapshotKey) -> Result<Option<String>, SnapshotError> {
        let flat_key = key.flat_key();
        let payload = self.store.get(&flat_key)?;
        if payload.is_some() {
            self.store.remove(&flat_key)?;
        }
        Ok(payload)
    }

    async fn remove(&self, key: &SnapshotKey) -> Result<(), SnapshotError> {
        Ok(self.store.remove(&key.flat_key())?)
    }
}

/// Ordered chain of snapshot tiers.
///
/// Saving uses the first tier that accepts the snapshot and clears the key
/// from every other tier. Consuming takes the first readable copy and clears
/// the key everywhere, so a snapshot is handed out at most once.
pub struct SnapshotStore {
    tiers: Vec<Box<dyn SnapshotTier>>,
}

impl SnapshotStore {
    pub fn new(tiers: Vec<Box<dyn SnapshotTier>>) -> Self {
        Self { tiers }
    }

    /// A store with no tiers: saves fail with `Unavailable`, consumes find
    /// nothing.
    pub fn disabled() -> Self {
        Self { tiers: Vec::new() }
    }

    /// The standard chain: SQLite under `data_dir`, then the flat store.
    /// A database that cannot be opened is skipped.
    pub async fn open(data_dir: &Path, flat: Arc<dyn KeyValueStore>) -> Self {
        let mut tiers: Vec<Box<dyn SnapshotTier>> = Vec::new();
        match SqliteSnapshotTier::open(&data_dir.join(DATABASE_FILE)).await {
            Ok(tier) => tiers.push(Box::new(tier)),
            Err(e) => tracing::warn!("Snapshot database unavailable, using flat store: {}", e),
        }
        tiers.push(Box::new(FlatSnapshotTier::new(flat)));
        Self::new(tiers)
    }

    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|tier| tier.name()).collect()
    }

    async fn remove_except(&self, key: &SnapshotKey, keep: usize) {
        for (index, tier) in self.tiers.iter().enumerate() {
            if index == keep {
                continue;
            }
            if let Err(e) = tier.remove(key).await {
                tracing::debug!("Failed to clear {} snapshot from {}: {}", key.record_key(), tier.name(), e);
            }
        }
    }

    /// Parks `snapshot` under (`mode`, `epoch`). Returns the tier that took it.
    pub async fn save(
        &self,
        snapshot: &EpochSnapshot,
        mode: Mode,
        epoch: u32,
    ) -> Result<&'static str, SnapshotError> {
        let key = SnapshotKey::new(mode, epoch);
        let payload = serde_json::to_string(snapshot)?;

        for (index, tier) in self.tiers.iter().enumerate() {
            match tier.try_save(&key, snapshot.created_at, &payload).await {
                Ok(()) => {
                    self.remove_except(&key, index).await;
                    tracing::info!(
                        "Saved {} snapshot ({} records) to {}",
                        key.record_key(),
                        snapshot.record_count(),
                        tier.name()
                    );
                    return Ok(tier.name());
                }
                Err(e) => {
                    tracing::warn!("Failed to save snapshot to {}: {}", tier.name(), e);
                }
            }
        }

        tracing::warn!("No snapshot storage accepted {}", key.record_key());
        Err(SnapshotError::Unavailable)
    }

    /// Takes the snapshot parked under (`mode`, `epoch`), if any.
    ///
    /// Unreadable tiers and undecodable payloads count as absent.
    pub async fn consume(&self, mode: Mode, epoch: u32) -> Option<EpochSnapshot> {
        let key = SnapshotKey::new(mode, epoch);

        for (index, tier) in self.tiers.iter().enumerate() {
            let payload = match tier.try_consume(&key).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Failed to read snapshot from {}: {}", tier.name(), e);
                    continue;
                }
            };

            match serde_json::from_str::<EpochSnapshot>(&payload) {
                Ok(snapshot) => {
                    self.remove_except(&key, index).await;
                    tracing::info!(
                        "Consumed {} snapshot from {}",
                        key.record_key(),
                        tier.name()
                    );
                    return Some(snapshot);
                }
                Err(e) => {
                    tracing::warn!("Discarding corrupt snapshot from {}: {}", tier.name(), e);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::models::{Breast, FeedingInProgress, FeedingSession};
    use tempfile::TempDir;

    struct FailingTier;

    #[async_trait]
    impl SnapshotTier for FailingTier {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn try_save(
            &self,
            _key: &SnapshotKey,
            _created_at: DateTime<Utc>,
            _payload: &str,
        ) -> Result<(), SnapshotError> {
            Err(SnapshotError::Unavailable)
        }

        async fn try_consume(&self, _key: &SnapshotKey) -> Result<Option<String>, SnapshotError> {
            Err(SnapshotError::Unavailable)
        }

        async fn remove(&self, _key: &SnapshotKey) -> Result<(), SnapshotError> {
            Err(SnapshotError::Unavailable)
        }
    }

    fn sample() -> EpochSnapshot {
        let now = Utc::now();
        EpochSnapshot {
            feeding_sessions: vec![FeedingSession::new(Breast::Left, now, now).with_id("s1")],
            feeding_in_progress: Some(FeedingInProgress::start(Breast::Right)),
            ..EpochSnapshot::default()
        }
    }

    async fn test_store() -> (SnapshotStore, Arc<MemoryKvStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let flat = Arc::new(MemoryKvStore::new());
        let store = SnapshotStore::open(temp_dir.path(), flat.clone()).await;
        (store, flat, temp_dir)
    }

    #[test]
    fn test_keys() {
        let key = SnapshotKey::new(Mode::Test, 4);
        assert_eq!(key.record_key(), "test:4");
        assert_eq!(key.flat_key(), "adameter-yjs-epoch-snapshot-v1:test:4");
    }

    #[tokio::test]
    async fn test_consume_once() {
        let (store, _flat, _dir) = test_store().await;
        assert_eq!(store.tier_names(), vec!["sqlite", "flat"]);

        let snapshot = sample();
        assert_eq!(
            store.save(&snapshot, Mode::Production, 1).await.unwrap(),
            "sqlite"
        );
        assert_eq!(store.consume(Mode::Production, 1).await, Some(snapshot));
        assert_eq!(store.consume(Mode::Production, 1).await, None);
    }

    #[tokio::test]
    async fn test_structured_save_clears_stale_fallback() {
        let (store, flat, _dir) = test_store().await;
        let key = SnapshotKey::new(Mode::Production, 2);
        flat.set(&key.flat_key(), "{\"stale\": true}").unwrap();

        store.save(&sample(), Mode::Production, 2).await.unwrap();
        assert!(flat.get(&key.flat_key()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_falls_back_to_flat_store() {
        let flat = Arc::new(MemoryKvStore::new());
        let store = SnapshotStore::new(vec![
            Box::new(FailingTier),
            Box::new(FlatSnapshotTier::new(flat.clone())),
        ]);

        let snapshot = sample();
        assert_eq!(store.save(&snapshot, Mode::Test, 3).await.unwrap(), "flat");
        assert!(flat
            .get("adameter-yjs-epoch-snapshot-v1:test:3")
            .unwrap()
            .is_some());

        assert_eq!(store.consume(Mode::Test, 3).await, Some(snapshot));
        assert!(flat
            .get("adameter-yjs-epoch-snapshot-v1:test:3")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_reads_as_absent() {
        let flat = Arc::new(MemoryKvStore::new());
        flat.set("adameter-yjs-epoch-snapshot-v1:production:1", "not json")
            .unwrap();
        let store = SnapshotStore::new(vec![Box::new(FlatSnapshotTier::new(flat.clone()))]);

        assert_eq!(store.consume(Mode::Production, 1).await, None);
        assert!(flat
            .get("adameter-yjs-epoch-snapshot-v1:production:1")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_no_tiers_is_unavailable() {
        let store = SnapshotStore::disabled();
        assert!(matches!(
            store.save(&sample(), Mode::Production, 1).await,
            Err(SnapshotError::Unavailable)
        ));
        assert_eq!(store.consume(Mode::Production, 1).await, None);

        let failing = SnapshotStore::new(vec![Box::new(FailingTier)]);
        assert!(failing.save(&sample(), Mode::Production, 1).await.is_err());
    }
}
