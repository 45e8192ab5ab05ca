//! Persisted room, mode and epoch selection.
//!
//! Older installs stored one `room` string that already carried the epoch
//! suffix. The first read of the base room migrates that value into the
//! separate fields; afterwards the separate fields are authoritative.

use std::sync::Arc;

use crate::kv::{KeyValueStore, KvError};
use crate::room::{self, Mode};

pub const MODE_KEY: &str = "adameter-yjs-epoch-mode-v1";
pub const PRODUCTION_EPOCH_KEY: &str = "adameter-yjs-epoch-production-v1";
pub const TEST_EPOCH_KEY: &str = "adameter-yjs-epoch-test-v1";
pub const BASE_ROOM_KEY: &str = "adameter-room-base-v1";
pub const LEGACY_ROOM_KEY: &str = "room";

fn epoch_key(mode: Mode) -> &'static str {
    match mode {
        Mode::Production => PRODUCTION_EPOCH_KEY,
        Mode::Test => TEST_EPOCH_KEY,
    }
}

/// Parses a stored epoch, reading anything unusable as 0.
fn parse_epoch(value: Option<String>) -> u32 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.clamp(0, u32::MAX as i64) as u32)
        .unwrap_or(0)
}

/// A room as typed by a user, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSelection {
    pub base: String,
    pub epoch: u32,
    pub mode: Mode,
}

impl RoomSelection {
    pub fn effective_room(&self) -> String {
        room::effective_room(&self.base, self.epoch, self.mode)
    }
}

/// Room/epoch settings over a key-value store.
///
/// Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct SyncSettings {
    store: Arc<dyn KeyValueStore>,
}

impl SyncSettings {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn mode(&self) -> Mode {
        match self.store.get(MODE_KEY) {
            Ok(Some(value)) => value.parse().unwrap_or_default(),
            Ok(None) => Mode::default(),
            Err(e) => {
                tracing::warn!("Failed to read sync mode: {}", e);
                Mode::default()
            }
        }
    }

    pub fn set_mode(&self, mode: Mode) -> Result<(), KvError> {
        self.store.set(MODE_KEY, mode.as_str())
    }

    pub fn epoch(&self, mode: Mode) -> u32 {
        match self.store.get(epoch_key(mode)) {
            Ok(value) => parse_epoch(value),
            Err(e) => {
                tracing::warn!("Failed to read {} epoch: {}", mode, e);
                0
            }
        }
    }

    pub fn set_epoch(&self, epoch: u32, mode: Mode) -> Result<(), KvError> {
        self.store.set(epoch_key(mode), &epoch.to_string())
    }

    /// Bumps the epoch for `mode` and returns the new value.
    pub fn increment_epoch(&self, mode: Mode) -> Result<u32, KvError> {
        let next = self.epoch(mode).saturating_add(1);
        self.set_epoch(next, mode)?;
        Ok(next)
    }

    /// Returns the stored base room, migrating a legacy room value if that
    /// is all there is.
    pub fn stored_base_room(&self) -> Result<Option<String>, KvError> {
        if let Some(base) = self.store.get(BASE_ROOM_KEY)? {
            if !base.is_empty() {
                return Ok(Some(base));
            }
        }

        let legacy = match self.store.get(LEGACY_ROOM_KEY)? {
            Some(legacy) if !legacy.is_empty() => legacy,
            _ => return Ok(None),
        };

        let mode = room::mode_of(&legacy);
        self.set_mode(mode)?;

        let base = room::base_room(&legacy);
        self.store.set(BASE_ROOM_KEY, &base)?;

        if let Some(epoch) = room::epoch_of(&legacy) {
            if epoch > self.epoch(mode) {
                self.set_epoch(epoch, mode)?;
            }
        }

        tracing::info!("Migrated legacy room {} to base room {} ({})", legacy, base, mode);
        Ok(Some(base))
    }

    /// Stores `room` as the base room, or clears it.
    ///
    /// The legacy `room` key is kept in step with the effective room so an
    /// older build reading the same store still lands in the right room.
    pub fn set_stored_base_room(
        &self,
        room: Option<&str>,
        epoch: u32,
        mode: Mode,
    ) -> Result<(), KvError> {
        match room {
            Some(room) if !room.is_empty() => {
                let base = room::base_room(room);
                self.store.set(BASE_ROOM_KEY, &base)?;
                self.store
                    .set(LEGACY_ROOM_KEY, &room::effective_room(&base, epoch, mode))
            }
            _ => {
                self.store.remove(BASE_ROOM_KEY)?;
                self.store.remove(LEGACY_ROOM_KEY)
            }
        }
    }

    /// The effective room for the current base room, mode and epoch.
    pub fn effective_room(&self) -> Result<Option<String>, KvError> {
        let base = self.stored_base_room()?;
        let mode = self.mode();
        Ok(base.map(|base| room::effective_room(&base, self.epoch(mode), mode)))
    }

    /// Interprets a room typed by the user.
    ///
    /// A room carrying an epoch suffix selects that mode and epoch; a bare
    /// name keeps the current mode and its epoch.
    pub fn resolve_room_input(&self, input: &str) -> RoomSelection {
        let input = input.trim();
        match room::epoch_of(input) {
            Some(epoch) => RoomSelection {
                base: room::base_room(input),
                epoch,
                mode: room::mode_of(input),
            },
            None => {
                let mode = self.mode();
                RoomSelection {
                    base: input.to_string(),
                    epoch: self.epoch(mode),
                    mode,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn test_settings() -> (SyncSettings, Arc<MemoryKvStore>) {
        let store = Arc::new(MemoryKvStore::new());
        (SyncSettings::new(store.clone()), store)
    }

    #[test]
    fn test_defaults() {
        let (settings, _) = test_settings();
        assert_eq!(settings.mode(), Mode::Production);
        assert_eq!(settings.epoch(Mode::Production), 0);
        assert_eq!(settings.stored_base_room().unwrap(), None);
        assert_eq!(settings.effective_room().unwrap(), None);
    }

    #[test]
    fn test_invalid_stored_values_read_as_defaults() {
        let (settings, store) = test_settings();
        store.set(MODE_KEY, "staging").unwrap();
        store.set(PRODUCTION_EPOCH_KEY, "-4").unwrap();
        store.set(TEST_EPOCH_KEY, "banana").unwrap();
        assert_eq!(settings.mode(), Mode::Production);
        assert_eq!(settings.epoch(Mode::Production), 0);
        assert_eq!(settings.epoch(Mode::Test), 0);
    }

    #[test]
    fn test_epochs_are_per_mode() {
        let (settings, _) = test_settings();
        assert_eq!(settings.increment_epoch(Mode::Test).unwrap(), 1);
        assert_eq!(settings.increment_epoch(Mode::Test).unwrap(), 2);
        assert_eq!(settings.epoch(Mode::Test), 2);
        assert_eq!(settings.epoch(Mode::Production), 0);
    }

    #[test]
    fn test_legacy_migration_runs_once() {
        let (settings, store) = test_settings();
        store.set(LEGACY_ROOM_KEY, "family__test-epoch__3").unwrap();

        assert_eq!(
            settings.stored_base_room().unwrap().as_deref(),
            Some("family")
        );
        assert_eq!(settings.mode(), Mode::Test);
        assert!(settings.epoch(Mode::Test) >= 3);

        // Later changes to the epoch are not undone by another read.
        settings.set_epoch(1, Mode::Test).unwrap();
        assert_eq!(
            settings.stored_base_room().unwrap().as_deref(),
            Some("family")
        );
        assert_eq!(settings.epoch(Mode::Test), 1);
    }

    #[test]
    fn test_legacy_migration_keeps_higher_epoch() {
        let (settings, store) = test_settings();
        store.set(PRODUCTION_EPOCH_KEY, "9").unwrap();
        store.set(LEGACY_ROOM_KEY, "family__epoch__2").unwrap();

        settings.stored_base_room().unwrap();
        assert_eq!(settings.epoch(Mode::Production), 9);
        assert_eq!(
            settings.effective_room().unwrap().as_deref(),
            Some("family__epoch__9")
        );
    }

    #[test]
    fn test_set_stored_base_room_writes_both_keys() {
        let (settings, store) = test_settings();
        settings
            .set_stored_base_room(Some("family__epoch__4"), 2, Mode::Production)
            .unwrap();
        assert_eq!(store.get(BASE_ROOM_KEY).unwrap().as_deref(), Some("family"));
        assert_eq!(
            store.get(LEGACY_ROOM_KEY).unwrap().as_deref(),
            Some("family__epoch__2")
        );

        settings
            .set_stored_base_room(None, 0, Mode::Production)
            .unwrap();
        assert!(store.get(BASE_ROOM_KEY).unwrap().is_none());
        assert!(store.get(LEGACY_ROOM_KEY).unwrap().is_none());
        assert_eq!(settings.stored_base_room().unwrap(), None);
    }

    #[test]
    fn test_resolve_room_input() {
        let (settings, _) = test_settings();
        settings.set_epoch(5, Mode::Production).unwrap();

        let plain = settings.resolve_room_input(" family ");
        assert_eq!(
            plain,
            RoomSelection {
                base: "family".to_string(),
                epoch: 5,
                mode: Mode::Production,
            }
        );

        let suffixed = settings.resolve_room_input("family__test-epoch__2");
        assert_eq!(suffixed.mode, Mode::Test);
        assert_eq!(suffixed.epoch, 2);
        assert_eq!(suffixed.effective_room(), "family__test-epoch__2");
    }
}
