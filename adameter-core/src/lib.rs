//! AdaMeter Core Library
//!
//! Local-first replica, room epochs and relay sync shared by the AdaMeter
//! applications.

pub mod collections;
pub mod context;
pub mod identity;
pub mod kv;
pub mod models;
pub mod persistence;
pub mod replica;
pub mod room;
pub mod settings;
pub mod snapshot;
pub mod sync;

pub use collections::{Collection, CollectionChange, Collections, RecordError, Slot, SlotChange};
pub use context::{AppContext, ContextError, ContextOptions};
pub use identity::get_device_id;
pub use kv::{FileKvStore, KeyValueStore, KvError, MemoryKvStore};
pub use models::{
    Breast, DiaperChange, Event, FeedingInProgress, FeedingSession, GrowthMeasurement,
    MedicationAdministration, MedicationRegimen, Record,
};
pub use persistence::{LocalPersister, PersistenceError};
pub use replica::{NodeKey, Origin, Replica, ReplicaError};
pub use room::Mode;
pub use settings::{RoomSelection, SyncSettings};
pub use snapshot::{EpochSnapshot, SnapshotError, SnapshotStore};
pub use sync::{
    check_relay, BootstrapDecision, JoinStrategy, SessionHandle, SessionState, SyncError,
    WsConnector,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
