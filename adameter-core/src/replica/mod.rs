//! The shared Automerge replica.
//!
//! One [`Replica`] per process holds the document every durable collection
//! is bound to. The document layout is:
//!
//! ```text
//! ROOT
//! ├── diaperChanges        list of record maps
//! ├── events               list
//! ├── feedingSessions      list
//! ├── growthMeasurements   list
//! ├── medicationRegimens   list
//! ├── medications          list
//! └── feedingInProgress    map { current: record map | null }
//! ```
//!
//! The containers are created by a fixed genesis change that every replica
//! shares, so two replicas created independently still merge into the same
//! lists instead of one list shadowing the other.
//!
//! All access goes through one mutex; merges are never run concurrently.
//! Every change is announced on a broadcast channel tagged with its origin.

pub mod bridge;
pub mod json;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use automerge::sync::{self, SyncDoc};
use automerge::transaction::{CommitOptions, Transactable};
use automerge::{
    ActorId, AutoCommit, AutomergeError, ChangeHash, ObjId, ObjType, ReadDoc, ScalarValue, ROOT,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::broadcast;

/// Actor that authors the genesis change. Never used for anything else.
const GENESIS_ACTOR: [u8; 16] = *b"adameter-genesis";

/// Key of the singleton record inside the `feedingInProgress` map.
pub const SLOT_KEY: &str = "current";

const EVENT_CAPACITY: usize = 256;

/// A top-level container in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKey {
    DiaperChanges,
    Events,
    FeedingSessions,
    GrowthMeasurements,
    MedicationRegimens,
    Medications,
    FeedingInProgress,
}

impl NodeKey {
    pub const LISTS: [NodeKey; 6] = [
        NodeKey::DiaperChanges,
        NodeKey::Events,
        NodeKey::FeedingSessions,
        NodeKey::GrowthMeasurements,
        NodeKey::MedicationRegimens,
        NodeKey::Medications,
    ];

    /// Key under the document root.
    pub fn key(&self) -> &'static str {
        match self {
            NodeKey::DiaperChanges => "diaperChanges",
            NodeKey::Events => "events",
            NodeKey::FeedingSessions => "feedingSessions",
            NodeKey::GrowthMeasurements => "growthMeasurements",
            NodeKey::MedicationRegimens => "medicationRegimens",
            NodeKey::Medications => "medications",
            NodeKey::FeedingInProgress => "feedingInProgress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        NodeKey::LISTS
            .into_iter()
            .chain([NodeKey::FeedingInProgress])
            .find(|node| node.key().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Where a change to the replica came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A bound collection, identified by its binding id.
    Binding(u64),
    /// The relay.
    Remote,
    /// The on-device store.
    Persistence,
}

/// Announcement of a change. `node` is `None` when any node may have changed.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaEvent {
    pub origin: Origin,
    pub node: Option<NodeKey>,
}

impl ReplicaEvent {
    pub fn touches(&self, node: NodeKey) -> bool {
        self.node.is_none_or(|changed| changed == node)
    }
}

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("automerge error: {0}")]
    Automerge(#[from] AutomergeError),
    #[error("document has no {0} container")]
    MissingNode(NodeKey),
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

struct Shared {
    doc: Mutex<AutoCommit>,
    events: broadcast::Sender<ReplicaEvent>,
}

/// Handle to the process-wide replica. Clones share the document.
#[derive(Clone)]
pub struct Replica {
    shared: Arc<Shared>,
}

/// Builds the genesis document every replica starts from.
fn genesis() -> Result<AutoCommit, AutomergeError> {
    let mut doc = AutoCommit::new().with_actor(ActorId::from(GENESIS_ACTOR.to_vec()));
    for node in NodeKey::LISTS {
        doc.put_object(ROOT, node.key(), ObjType::List)?;
    }
    let slot = doc.put_object(ROOT, NodeKey::FeedingInProgress.key(), ObjType::Map)?;
    doc.put(&slot, SLOT_KEY, ScalarValue::Null)?;
    doc.commit_with(CommitOptions::default().with_time(0).with_message("genesis".to_string()));
    Ok(doc)
}

/// Gives `doc` the shared containers and a fresh actor of its own.
fn prepare(mut doc: AutoCommit) -> Result<AutoCommit, AutomergeError> {
    let mut base = genesis()?;
    doc.merge(&mut base)?;
    doc.set_actor(ActorId::random());
    Ok(doc)
}

/// Looks up the object id of a top-level container.
pub fn node_obj(doc: &AutoCommit, node: NodeKey) -> Result<ObjId, ReplicaError> {
    match doc.get(ROOT, node.key())? {
        Some((automerge::Value::Object(_), id)) => Ok(id),
        _ => Err(ReplicaError::MissingNode(node)),
    }
}

/// Reads one container as JSON. Lists become arrays; the slot node yields
/// its `current` value.
pub fn read_node(doc: &AutoCommit, node: NodeKey) -> Result<JsonValue, ReplicaError> {
    let obj = node_obj(doc, node)?;
    let value = json::read_object(doc, &obj)?;
    Ok(match node {
        NodeKey::FeedingInProgress => value.get(SLOT_KEY).cloned().unwrap_or(JsonValue::Null),
        _ => value,
    })
}

/// Creates a fresh document containing only the genesis containers.
pub fn new_document() -> Result<AutoCommit, ReplicaError> {
    Ok(prepare(AutoCommit::new())?)
}

/// True when no container holds any record.
pub fn document_is_empty(doc: &AutoCommit) -> Result<bool, ReplicaError> {
    for node in NodeKey::LISTS {
        if doc.length(&node_obj(doc, node)?) > 0 {
            return Ok(false);
        }
    }
    Ok(read_node(doc, NodeKey::FeedingInProgress)?.is_null())
}

impl Replica {
    pub fn new() -> Result<Self, ReplicaError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                doc: Mutex::new(new_document()?),
                events,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AutoCommit> {
        // A panic while holding the lock leaves a document that is still
        // internally consistent, so keep using it.
        self.shared.doc.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, origin: Origin, node: Option<NodeKey>) {
        // No subscribers is fine.
        let _ = self.shared.events.send(ReplicaEvent { origin, node });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.shared.events.subscribe()
    }

    /// Runs `f` against one container and commits the result.
    ///
    /// A failing `f` is rolled back. Subscribers are told about the change
    /// only if the document actually changed.
    pub fn change<R>(
        &self,
        origin: Origin,
        node: NodeKey,
        f: impl FnOnce(&mut AutoCommit, &ObjId) -> Result<R, ReplicaError>,
    ) -> Result<R, ReplicaError> {
        let (committed, result) = {
            let mut doc = self.lock();
            let obj = node_obj(&doc, node)?;
            match f(&mut doc, &obj) {
                Ok(result) => (doc.commit().is_some(), result),
                Err(e) => {
                    doc.rollback();
                    return Err(e);
                }
            }
        };

        if committed {
            self.emit(origin, Some(node));
        }
        Ok(result)
    }

    pub fn read_node(&self, node: NodeKey) -> Result<JsonValue, ReplicaError> {
        read_node(&self.lock(), node)
    }

    pub fn is_empty(&self) -> Result<bool, ReplicaError> {
        document_is_empty(&self.lock())
    }

    pub fn heads(&self) -> Vec<ChangeHash> {
        self.lock().get_heads()
    }

    /// Full compacted encoding of the document.
    pub fn save(&self) -> Vec<u8> {
        self.lock().save()
    }

    /// An independent copy of the document with its own actor.
    pub fn fork(&self) -> AutoCommit {
        self.lock().fork()
    }

    /// Applies encoded changes (a saved document or incremental chunks).
    pub fn load_incremental(&self, bytes: &[u8], origin: Origin) -> Result<usize, ReplicaError> {
        let applied = self.lock().load_incremental(bytes)?;
        if applied > 0 {
            self.emit(origin, None);
        }
        Ok(applied)
    }

    /// Merges another document into this one. Returns whether anything new
    /// arrived.
    pub fn merge(&self, other: &mut AutoCommit, origin: Origin) -> Result<bool, ReplicaError> {
        let merged = self.lock().merge(other)?;
        if !merged.is_empty() {
            self.emit(origin, None);
        }
        Ok(!merged.is_empty())
    }

    /// Throws away the current document and adopts `doc` instead.
    pub fn replace(&self, doc: AutoCommit, origin: Origin) -> Result<(), ReplicaError> {
        let doc = prepare(doc)?;
        *self.lock() = doc;
        self.emit(origin, None);
        Ok(())
    }

    pub fn generate_sync_message(&self, state: &mut sync::State) -> Option<sync::Message> {
        self.lock().sync().generate_sync_message(state)
    }

    /// Applies a sync message from a peer. Returns whether the document
    /// changed.
    pub fn receive_sync_message(
        &self,
        state: &mut sync::State,
        message: sync::Message,
        origin: Origin,
    ) -> Result<bool, ReplicaError> {
        let changed = {
            let mut doc = self.lock();
            let before = doc.get_heads();
            doc.sync().receive_sync_message(state, message)?;
            doc.get_heads() != before
        };
        if changed {
            self.emit(origin, None);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push(replica: &Replica, node: NodeKey, value: JsonValue) {
        replica
            .change(Origin::Binding(0), node, |doc, obj| {
                Ok(json::list_push(doc, obj, &value)?)
            })
            .unwrap();
    }

    #[test]
    fn test_new_replica_is_empty() {
        let replica = Replica::new().unwrap();
        assert!(replica.is_empty().unwrap());
        assert_eq!(replica.read_node(NodeKey::Events).unwrap(), json!([]));
        assert_eq!(
            replica.read_node(NodeKey::FeedingInProgress).unwrap(),
            JsonValue::Null
        );
    }

    #[test]
    fn test_genesis_is_shared() {
        let a = Replica::new().unwrap();
        let b = Replica::new().unwrap();
        assert_eq!(a.heads(), b.heads());
    }

    #[test]
    fn test_independent_replicas_merge_into_same_list() {
        let a = Replica::new().unwrap();
        let b = Replica::new().unwrap();
        push(&a, NodeKey::FeedingSessions, json!({"id": "x"}));
        push(&b, NodeKey::FeedingSessions, json!({"id": "y"}));

        let mut from_b = b.fork();
        assert!(a.merge(&mut from_b, Origin::Remote).unwrap());

        let sessions = a.read_node(NodeKey::FeedingSessions).unwrap();
        let ids: Vec<&str> = sessions
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"x"));
        assert!(ids.contains(&"y"));
    }

    #[tokio::test]
    async fn test_change_emits_event_with_origin() {
        let replica = Replica::new().unwrap();
        let mut events = replica.subscribe();
        push(&replica, NodeKey::Events, json!({"id": "e1", "date": "2024-01-01"}));

        let event = events.recv().await.unwrap();
        assert_eq!(event.origin, Origin::Binding(0));
        assert!(event.touches(NodeKey::Events));
        assert!(!event.touches(NodeKey::Medications));
    }

    #[test]
    fn test_failed_change_is_rolled_back() {
        let replica = Replica::new().unwrap();
        let before = replica.heads();
        let result: Result<(), ReplicaError> =
            replica.change(Origin::Binding(0), NodeKey::Events, |doc, obj| {
                json::list_push(doc, obj, &json!({"id": "e1"}))?;
                Err(ReplicaError::MissingNode(NodeKey::Events))
            });
        assert!(result.is_err());
        assert_eq!(replica.heads(), before);
        assert!(replica.is_empty().unwrap());
    }

    #[test]
    fn test_replace_adopts_other_document() {
        let source = Replica::new().unwrap();
        push(&source, NodeKey::DiaperChanges, json!({"id": "d1"}));

        let target = Replica::new().unwrap();
        push(&target, NodeKey::DiaperChanges, json!({"id": "local"}));
        target.replace(source.fork(), Origin::Remote).unwrap();

        assert_eq!(
            target.read_node(NodeKey::DiaperChanges).unwrap(),
            json!([{"id": "d1"}])
        );
    }

    #[test]
    fn test_load_incremental_from_saved_bytes() {
        let source = Replica::new().unwrap();
        push(&source, NodeKey::Medications, json!({"id": "m1"}));
        let bytes = source.save();

        let target = Replica::new().unwrap();
        target.load_incremental(&bytes, Origin::Persistence).unwrap();
        assert!(!target.is_empty().unwrap());
    }

    #[test]
    fn test_node_key_parse() {
        assert_eq!(NodeKey::parse("diaperChanges"), Some(NodeKey::DiaperChanges));
        assert_eq!(NodeKey::parse("MEDICATIONS"), Some(NodeKey::Medications));
        assert_eq!(NodeKey::parse("dishes"), None);
    }
}
