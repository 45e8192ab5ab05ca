//! Durable collections: the in-memory containers the application reads and
//! mutates.
//!
//! Mutations apply synchronously and in call order. While a collection is
//! bound to the replica, each mutation also emits a typed change that the
//! binding task writes into the replica.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use automerge::transaction::Transactable;
use automerge::{AutoCommit, ObjId, ObjType, ReadDoc, ScalarValue, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::models::{
    DiaperChange, Event, FeedingInProgress, FeedingSession, GrowthMeasurement,
    MedicationAdministration, MedicationRegimen, Record,
};
use crate::replica::bridge::{self, Bindable, BindingSet, BridgeError};
use crate::replica::{json, NodeKey, Replica, ReplicaError, SLOT_KEY};

/// A mutation of a [`Collection`].
#[derive(Debug, Clone)]
pub enum CollectionChange<T> {
    Push(T),
    Upsert(T),
    Remove(String),
    Replace(Vec<T>),
}

/// A mutation of a [`Slot`].
#[derive(Debug, Clone)]
pub enum SlotChange<T> {
    Set(Option<T>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Decodes a replica list into records, keeping the first record for each
/// id and skipping anything that does not decode.
pub fn decode_records<T: Record>(node: NodeKey, value: JsonValue) -> Vec<T> {
    let JsonValue::Array(items) = value else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<T>(item) {
            Ok(record) => {
                if seen.insert(record.id().to_string()) {
                    records.push(record);
                }
            }
            Err(e) => tracing::warn!("Skipping unreadable {} record: {}", node, e),
        }
    }
    records
}

/// Decodes the slot value, treating anything unreadable as empty.
pub fn decode_slot<T: DeserializeOwned>(node: NodeKey, value: JsonValue) -> Option<T> {
    if value.is_null() {
        return None;
    }
    match serde_json::from_value(value) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring unreadable {} value: {}", node, e);
            None
        }
    }
}

/// Keeps the first record for each id.
fn dedupe<T: Record>(records: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.id().to_string()))
        .collect()
}

struct ListState<T> {
    items: Vec<T>,
    changes: Option<mpsc::UnboundedSender<CollectionChange<T>>>,
}

impl<T: Clone> ListState<T> {
    fn emit(&self, change: CollectionChange<T>) {
        if let Some(changes) = &self.changes {
            let _ = changes.send(change);
        }
    }
}

/// An ordered collection of records with unique ids.
pub struct Collection<T> {
    node: NodeKey,
    state: Mutex<ListState<T>>,
}

impl<T: Record> Collection<T> {
    pub fn new(node: NodeKey) -> Self {
        Self {
            node,
            state: Mutex::new(ListState {
                items: Vec::new(),
                changes: None,
            }),
        }
    }

    /// A copy of every record, in order.
    pub fn items(&self) -> Vec<T> {
        lock(&self.state).items.clone()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        lock(&self.state)
            .items
            .iter()
            .find(|record| record.id() == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).items.is_empty()
    }

    /// Appends `record`. A record whose id is already present replaces the
    /// existing one in place.
    pub fn push(&self, record: T) {
        let mut state = lock(&self.state);
        match state.items.iter().position(|r| r.id() == record.id()) {
            Some(index) => {
                state.items[index] = record.clone();
                state.emit(CollectionChange::Upsert(record));
            }
            None => {
                state.items.push(record.clone());
                state.emit(CollectionChange::Push(record));
            }
        }
    }

    /// Replaces the record with the same id, or appends it.
    pub fn upsert(&self, record: T) {
        let mut state = lock(&self.state);
        match state.items.iter().position(|r| r.id() == record.id()) {
            Some(index) => state.items[index] = record.clone(),
            None => state.items.push(record.clone()),
        }
        state.emit(CollectionChange::Upsert(record));
    }

    /// Removes the record with `id`. Returns whether one was present.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = lock(&self.state);
        let before = state.items.len();
        state.items.retain(|record| record.id() != id);
        let removed = state.items.len() != before;
        if removed {
            state.emit(CollectionChange::Remove(id.to_string()));
        }
        removed
    }

    /// Replaces the whole contents in place.
    pub fn replace_all(&self, records: Vec<T>) {
        let records = dedupe(records);
        let mut state = lock(&self.state);
        state.items = records.clone();
        state.emit(CollectionChange::Replace(records));
    }

    pub fn clear(&self) {
        self.replace_all(Vec::new());
    }
}

impl<T: Record> Bindable for Collection<T> {
    type Change = CollectionChange<T>;

    fn node(&self) -> NodeKey {
        self.node
    }

    fn attach(&self, changes: mpsc::UnboundedSender<Self::Change>) -> Result<(), BridgeError> {
        let mut state = lock(&self.state);
        if state.changes.is_some() {
            return Err(BridgeError::AlreadyBound(self.node));
        }
        state.changes = Some(changes);
        Ok(())
    }

    fn detach(&self) {
        lock(&self.state).changes = None;
    }

    fn refresh(
        &self,
        read: &mut dyn FnMut() -> Result<JsonValue, ReplicaError>,
    ) -> Result<(), ReplicaError> {
        let mut state = lock(&self.state);
        state.items = decode_records(self.node, read()?);
        Ok(())
    }

    fn write(doc: &mut AutoCommit, obj: &ObjId, change: Self::Change) -> Result<(), ReplicaError> {
        match change {
            CollectionChange::Push(record) => {
                json::list_push(doc, obj, &serde_json::to_value(record)?)?;
            }
            CollectionChange::Upsert(record) => {
                json::list_upsert(doc, obj, &serde_json::to_value(record)?)?;
            }
            CollectionChange::Remove(id) => {
                json::list_remove(doc, obj, &id)?;
            }
            CollectionChange::Replace(records) => {
                let values = records
                    .into_iter()
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()?;
                json::list_replace(doc, obj, &values)?;
            }
        }
        Ok(())
    }
}

struct SlotState<T> {
    value: Option<T>,
    changes: Option<mpsc::UnboundedSender<SlotChange<T>>>,
}

/// Holds at most one value.
pub struct Slot<T> {
    node: NodeKey,
    state: Mutex<SlotState<T>>,
}

impl<T> Slot<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(node: NodeKey) -> Self {
        Self {
            node,
            state: Mutex::new(SlotState {
                value: None,
                changes: None,
            }),
        }
    }

    pub fn get(&self) -> Option<T> {
        lock(&self.state).value.clone()
    }

    pub fn set(&self, value: Option<T>) {
        let mut state = lock(&self.state);
        state.value = value.clone();
        if let Some(changes) = &state.changes {
            let _ = changes.send(SlotChange::Set(value));
        }
    }

    pub fn clear(&self) {
        self.set(None);
    }
}

impl<T> Bindable for Slot<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Change = SlotChange<T>;

    fn node(&self) -> NodeKey {
        self.node
    }

    fn attach(&self, changes: mpsc::UnboundedSender<Self::Change>) -> Result<(), BridgeError> {
        let mut state = lock(&self.state);
        if state.changes.is_some() {
            return Err(BridgeError::AlreadyBound(self.node));
        }
        state.changes = Some(changes);
        Ok(())
    }

    fn detach(&self) {
        lock(&self.state).changes = None;
    }

    fn refresh(
        &self,
        read: &mut dyn FnMut() -> Result<JsonValue, ReplicaError>,
    ) -> Result<(), ReplicaError> {
        let mut state = lock(&self.state);
        state.value = decode_slot(self.node, read()?);
        Ok(())
    }

    fn write(doc: &mut AutoCommit, obj: &ObjId, change: Self::Change) -> Result<(), ReplicaError> {
        let SlotChange::Set(value) = change;
        let Some(value) = value else {
            doc.put(obj, SLOT_KEY, ScalarValue::Null)?;
            return Ok(());
        };

        let value = serde_json::to_value(value)?;
        let current = match doc.get(obj, SLOT_KEY)? {
            Some((Value::Object(ObjType::Map), current)) => Some(current),
            _ => None,
        };
        match (current, &value) {
            (Some(current), JsonValue::Object(fields)) => json::update_map(doc, &current, fields)?,
            _ => json::put_value(doc, obj, SLOT_KEY, &value)?,
        }
        Ok(())
    }
}

/// Every durable collection plus the in-progress feeding slot.
pub struct Collections {
    pub diaper_changes: Arc<Collection<DiaperChange>>,
    pub events: Arc<Collection<Event>>,
    pub feeding_sessions: Arc<Collection<FeedingSession>>,
    pub growth_measurements: Arc<Collection<GrowthMeasurement>>,
    pub medication_regimens: Arc<Collection<MedicationRegimen>>,
    pub medications: Arc<Collection<MedicationAdministration>>,
    pub feeding_in_progress: Arc<Slot<FeedingInProgress>>,
}

impl Default for Collections {
    fn default() -> Self {
        Self::new()
    }
}

/// Error from the JSON entry points.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("invalid {node} record: {source}")]
    Invalid {
        node: NodeKey,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} does not hold records with ids")]
    NotAList(NodeKey),
}

fn insert_json<T: Record>(
    collection: &Collection<T>,
    mut value: JsonValue,
    device_id: &str,
) -> Result<String, RecordError> {
    if let JsonValue::Object(fields) = &mut value {
        fields
            .entry("id")
            .or_insert_with(|| JsonValue::String(uuid::Uuid::new_v4().to_string()));
    }
    let mut record: T = serde_json::from_value(value).map_err(|source| RecordError::Invalid {
        node: collection.node,
        source,
    })?;
    record.set_device_id(device_id);
    let id = record.id().to_string();
    collection.upsert(record);
    Ok(id)
}

fn items_json<T: Record>(collection: &Collection<T>) -> Vec<JsonValue> {
    collection
        .items()
        .iter()
        .filter_map(|record| serde_json::to_value(record).ok())
        .collect()
}

impl Collections {
    pub fn new() -> Self {
        Self {
            diaper_changes: Arc::new(Collection::new(NodeKey::DiaperChanges)),
            events: Arc::new(Collection::new(NodeKey::Events)),
            feeding_sessions: Arc::new(Collection::new(NodeKey::FeedingSessions)),
            growth_measurements: Arc::new(Collection::new(NodeKey::GrowthMeasurements)),
            medication_regimens: Arc::new(Collection::new(NodeKey::MedicationRegimens)),
            medications: Arc::new(Collection::new(NodeKey::Medications)),
            feeding_in_progress: Arc::new(Slot::new(NodeKey::FeedingInProgress)),
        }
    }

    /// True when no collection holds a record and the slot is empty.
    pub fn is_empty(&self) -> bool {
        self.diaper_changes.is_empty()
            && self.events.is_empty()
            && self.feeding_sessions.is_empty()
            && self.growth_measurements.is_empty()
            && self.medication_regimens.is_empty()
            && self.medications.is_empty()
            && self.feeding_in_progress.get().is_none()
    }

    /// Binds every collection to `replica`.
    ///
    /// Bindings made before a failure are released again.
    pub fn bind_all(&self, replica: &Replica) -> Result<BindingSet, BridgeError> {
        let bindings = vec![
            bridge::bind(self.diaper_changes.clone(), replica)?,
            bridge::bind(self.events.clone(), replica)?,
            bridge::bind(self.feeding_sessions.clone(), replica)?,
            bridge::bind(self.growth_measurements.clone(), replica)?,
            bridge::bind(self.medication_regimens.clone(), replica)?,
            bridge::bind(self.medications.clone(), replica)?,
            bridge::bind(self.feeding_in_progress.clone(), replica)?,
        ];
        Ok(BindingSet::new(bindings))
    }

    /// Records of a list node as JSON.
    pub fn list_json(&self, node: NodeKey) -> Result<Vec<JsonValue>, RecordError> {
        Ok(match node {
            NodeKey::DiaperChanges => items_json(&self.diaper_changes),
            NodeKey::Events => items_json(&self.events),
            NodeKey::FeedingSessions => items_json(&self.feeding_sessions),
            NodeKey::GrowthMeasurements => items_json(&self.growth_measurements),
            NodeKey::MedicationRegimens => items_json(&self.medication_regimens),
            NodeKey::Medications => items_json(&self.medications),
            NodeKey::FeedingInProgress => return Err(RecordError::NotAList(node)),
        })
    }

    /// Adds (or replaces) a record given as JSON, tagging it with
    /// `device_id`. A missing id is generated. Returns the record id.
    pub fn insert_json(
        &self,
        node: NodeKey,
        value: JsonValue,
        device_id: &str,
    ) -> Result<String, RecordError> {
        match node {
            NodeKey::DiaperChanges => insert_json(&self.diaper_changes, value, device_id),
            NodeKey::Events => insert_json(&self.events, value, device_id),
            NodeKey::FeedingSessions => insert_json(&self.feeding_sessions, value, device_id),
            NodeKey::GrowthMeasurements => {
                insert_json(&self.growth_measurements, value, device_id)
            }
            NodeKey::MedicationRegimens => {
                insert_json(&self.medication_regimens, value, device_id)
            }
            NodeKey::Medications => insert_json(&self.medications, value, device_id),
            NodeKey::FeedingInProgress => Err(RecordError::NotAList(node)),
        }
    }

    /// Removes a record from a list node. Returns whether it existed.
    pub fn remove(&self, node: NodeKey, id: &str) -> Result<bool, RecordError> {
        Ok(match node {
            NodeKey::DiaperChanges => self.diaper_changes.remove(id),
            NodeKey::Events => self.events.remove(id),
            NodeKey::FeedingSessions => self.feeding_sessions.remove(id),
            NodeKey::GrowthMeasurements => self.growth_measurements.remove(id),
            NodeKey::MedicationRegimens => self.medication_regimens.remove(id),
            NodeKey::Medications => self.medications.remove(id),
            NodeKey::FeedingInProgress => return Err(RecordError::NotAList(node)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Breast;
    use crate::replica::Origin;
    use chrono::Utc;
    use serde_json::json;

    fn session(id: &str) -> FeedingSession {
        let now = Utc::now();
        FeedingSession::new(Breast::Left, now, now).with_id(id)
    }

    fn ids<T: Record>(records: &[T]) -> Vec<String> {
        records.iter().map(|r| r.id().to_string()).collect()
    }

    #[test]
    fn test_push_keeps_ids_unique() {
        let sessions = Collection::new(NodeKey::FeedingSessions);
        sessions.push(session("a"));
        sessions.push(session("b"));
        sessions.push(session("a"));
        assert_eq!(ids(&sessions.items()), vec!["a", "b"]);
    }

    #[test]
    fn test_remove_and_replace_all() {
        let sessions = Collection::new(NodeKey::FeedingSessions);
        sessions.push(session("a"));
        assert!(sessions.remove("a"));
        assert!(!sessions.remove("a"));

        sessions.replace_all(vec![session("x"), session("y"), session("x")]);
        assert_eq!(ids(&sessions.items()), vec!["x", "y"]);
        sessions.clear();
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_decode_records_skips_bad_and_duplicate() {
        let value = json!([
            {"id": "e1", "date": "2024-01-01"},
            {"id": "e1", "date": "2024-02-02"},
            {"date": "no id"},
        ]);
        let events: Vec<Event> = decode_records(NodeKey::Events, value);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].date, "2024-01-01");
    }

    #[tokio::test]
    async fn test_local_mutation_reaches_replica() {
        let replica = Replica::new().unwrap();
        let collections = Collections::new();
        let bindings = collections.bind_all(&replica).unwrap();
        assert_eq!(bindings.len(), 7);

        collections.feeding_sessions.push(session("s1"));
        collections
            .feeding_in_progress
            .set(Some(FeedingInProgress::start(Breast::Right)));
        bindings.flush().await;

        let stored = replica.read_node(NodeKey::FeedingSessions).unwrap();
        assert_eq!(stored[0]["id"], "s1");
        let slot = replica.read_node(NodeKey::FeedingInProgress).unwrap();
        assert_eq!(slot["breast"], "right");
        assert_eq!(collections.feeding_sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_change_reaches_collection() {
        let replica = Replica::new().unwrap();
        let collections = Collections::new();
        let bindings = collections.bind_all(&replica).unwrap();

        let other = Replica::new().unwrap();
        other
            .change(Origin::Remote, NodeKey::Events, |doc, obj| {
                Ok(json::list_push(
                    doc,
                    obj,
                    &json!({"id": "e1", "date": "2024-01-01"}),
                )?)
            })
            .unwrap();
        replica.merge(&mut other.fork(), Origin::Remote).unwrap();
        bindings.flush().await;

        assert_eq!(ids(&collections.events.items()), vec!["e1"]);
    }

    #[tokio::test]
    async fn test_local_edits_leave_unreadable_records_in_replica() {
        let replica = Replica::new().unwrap();
        let collections = Collections::new();
        let bindings = collections.bind_all(&replica).unwrap();

        replica
            .change(Origin::Remote, NodeKey::FeedingSessions, |doc, obj| {
                json::list_push(
                    doc,
                    obj,
                    &json!({"id": "frac", "breast": "left", "durationInSeconds": 12.5}),
                )?;
                Ok(json::list_push(
                    doc,
                    obj,
                    &serde_json::to_value(session("old"))?,
                )?)
            })
            .unwrap();
        bindings.flush().await;
        assert_eq!(ids(&collections.feeding_sessions.items()), vec!["old"]);

        collections.feeding_sessions.push(session("new"));
        collections.feeding_sessions.remove("old");
        bindings.flush().await;

        let stored = replica.read_node(NodeKey::FeedingSessions).unwrap();
        let stored_ids: Vec<&str> = stored
            .as_array()
            .unwrap()
            .iter()
            .map(|record| record["id"].as_str().unwrap())
            .collect();
        assert_eq!(stored_ids, vec!["frac", "new"]);
        assert_eq!(stored[0]["durationInSeconds"], 12.5);
    }

    #[tokio::test]
    async fn test_bridge_merge_keeps_both_records() {
        let first = Replica::new().unwrap();
        let second = Replica::new().unwrap();
        let left = Collections::new();
        let right = Collections::new();
        let left_bindings = left.bind_all(&first).unwrap();
        let right_bindings = right.bind_all(&second).unwrap();

        left.diaper_changes
            .push(DiaperChange::new(Utc::now(), true, false).with_id("X"));
        right
            .diaper_changes
            .push(DiaperChange::new(Utc::now(), false, true).with_id("Y"));
        left_bindings.flush().await;
        right_bindings.flush().await;

        first.merge(&mut second.fork(), Origin::Remote).unwrap();
        second.merge(&mut first.fork(), Origin::Remote).unwrap();
        left_bindings.flush().await;
        right_bindings.flush().await;

        for side in [&left, &right] {
            let mut found = ids(&side.diaper_changes.items());
            found.sort();
            assert_eq!(found, vec!["X", "Y"]);
        }
    }

    #[tokio::test]
    async fn test_unbind_stops_propagation() {
        let replica = Replica::new().unwrap();
        let collections = Collections::new();
        let bindings = collections.bind_all(&replica).unwrap();
        bindings.unbind();
        bindings.unbind();

        collections.events.push(Event::new("2024-01-01", "after unbind"));
        bindings.flush().await;
        tokio::task::yield_now().await;
        assert!(replica.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_rebinding_requires_unbind() {
        let replica = Replica::new().unwrap();
        let collections = Collections::new();
        let bindings = collections.bind_all(&replica).unwrap();
        assert!(matches!(
            bridge::bind(collections.events.clone(), &replica),
            Err(BridgeError::AlreadyBound(NodeKey::Events))
        ));

        bindings.unbind();
        let rebound = bridge::bind(collections.events.clone(), &replica).unwrap();
        assert!(rebound.is_bound());
    }

    #[test]
    fn test_insert_json_generates_id_and_tags_device() {
        let collections = Collections::new();
        let id = collections
            .insert_json(
                NodeKey::GrowthMeasurements,
                json!({"date": "2024-04-01", "weight": 4200.0}),
                "device-a",
            )
            .unwrap();

        let stored = collections.growth_measurements.get(&id).unwrap();
        assert_eq!(stored.device_id.as_deref(), Some("device-a"));
        assert!(matches!(
            collections.insert_json(NodeKey::FeedingInProgress, json!({}), "d"),
            Err(RecordError::NotAList(_))
        ));
    }
}
