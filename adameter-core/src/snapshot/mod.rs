//! Epoch snapshots: point-in-time copies of every durable collection.
//!
//! A snapshot is captured before an epoch reset and parked in the
//! [`SnapshotStore`] until the replica for the new epoch is opened, where it
//! is consumed and applied.

mod store;

pub use store::{
    FlatSnapshotTier, SnapshotError, SnapshotKey, SnapshotStore, SnapshotTier, SqliteSnapshotTier,
    FLAT_KEY_PREFIX,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collections::Collections;
use crate::models::{
    DiaperChange, Event, FeedingInProgress, FeedingSession, GrowthMeasurement,
    MedicationAdministration, MedicationRegimen,
};

/// Full copy of the collections plus the in-progress feeding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochSnapshot {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub diaper_changes: Vec<DiaperChange>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub feeding_in_progress: Option<FeedingInProgress>,
    #[serde(default)]
    pub feeding_sessions: Vec<FeedingSession>,
    #[serde(default)]
    pub growth_measurements: Vec<GrowthMeasurement>,
    #[serde(default)]
    pub medication_regimens: Vec<MedicationRegimen>,
    #[serde(default)]
    pub medications: Vec<MedicationAdministration>,
}

impl Default for EpochSnapshot {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            diaper_changes: Vec::new(),
            events: Vec::new(),
            feeding_in_progress: None,
            feeding_sessions: Vec::new(),
            growth_measurements: Vec::new(),
            medication_regimens: Vec::new(),
            medications: Vec::new(),
        }
    }
}

impl EpochSnapshot {
    /// Copies the current contents of `collections`.
    pub fn capture(collections: &Collections) -> Self {
        Self {
            created_at: Utc::now(),
            diaper_changes: collections.diaper_changes.items(),
            events: collections.events.items(),
            feeding_in_progress: collections.feeding_in_progress.get(),
            feeding_sessions: collections.feeding_sessions.items(),
            growth_measurements: collections.growth_measurements.items(),
            medication_regimens: collections.medication_regimens.items(),
            medications: collections.medications.items(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.diaper_changes.is_empty()
            && self.events.is_empty()
            && self.feeding_in_progress.is_none()
            && self.feeding_sessions.is_empty()
            && self.growth_measurements.is_empty()
            && self.medication_regimens.is_empty()
            && self.medications.is_empty()
    }

    /// Total number of records, counting an in-progress feeding as one.
    pub fn record_count(&self) -> usize {
        self.diaper_changes.len()
            + self.events.len()
            + usize::from(self.feeding_in_progress.is_some())
            + self.feeding_sessions.len()
            + self.growth_measurements.len()
            + self.medication_regimens.len()
            + self.medications.len()
    }

    /// Replaces the live contents of `collections` in place. Bound
    /// collections pass the change on to the replica.
    pub fn apply(&self, collections: &Collections) {
        collections
            .diaper_changes
            .replace_all(self.diaper_changes.clone());
        collections.events.replace_all(self.events.clone());
        collections
            .feeding_in_progress
            .set(self.feeding_in_progress.clone());
        collections
            .feeding_sessions
            .replace_all(self.feeding_sessions.clone());
        collections
            .growth_measurements
            .replace_all(self.growth_measurements.clone());
        collections
            .medication_regimens
            .replace_all(self.medication_regimens.clone());
        collections.medications.replace_all(self.medications.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Breast;

    fn session(id: &str) -> FeedingSession {
        let now = Utc::now();
        FeedingSession::new(Breast::Left, now, now).with_id(id)
    }

    #[test]
    fn test_capture_is_detached_from_live_data() {
        let collections = Collections::new();
        collections.feeding_sessions.push(session("a"));

        let snapshot = EpochSnapshot::capture(&collections);
        collections.feeding_sessions.push(session("b"));
        collections.feeding_sessions.remove("a");

        assert_eq!(snapshot.feeding_sessions.len(), 1);
        assert_eq!(snapshot.feeding_sessions[0].id, "a");
        assert_eq!(snapshot.record_count(), 1);
    }

    #[test]
    fn test_apply_replaces_in_place() {
        let collections = Collections::new();
        collections.events.push(Event::new("2024-01-01", "old"));
        let events = collections.events.clone();

        let snapshot = EpochSnapshot {
            feeding_sessions: vec![session("s")],
            feeding_in_progress: Some(FeedingInProgress::start(Breast::Left)),
            ..EpochSnapshot::default()
        };
        snapshot.apply(&collections);

        assert!(events.is_empty());
        assert_eq!(collections.feeding_sessions.len(), 1);
        assert!(collections.feeding_in_progress.get().is_some());
    }

    #[test]
    fn test_serialized_field_names() {
        let value = serde_json::to_value(EpochSnapshot::default()).unwrap();
        for key in [
            "createdAt",
            "diaperChanges",
            "events",
            "feedingInProgress",
            "feedingSessions",
            "growthMeasurements",
            "medicationRegimens",
            "medications",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
    }
}
