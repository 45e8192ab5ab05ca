//! Reconciling local data with a room on first join.
//!
//! Joining captures the replica before the room is loaded, adopts whatever
//! the room holds, and then decides from the two sides and the caller's
//! [`JoinStrategy`] what the room should end up with.

use std::fmt;
use std::str::FromStr;

use serde_json::Value as JsonValue;

use super::error::SyncError;
use super::transport::{CancelToken, RemotePersister};
use crate::replica::{json, NodeKey, Origin, Replica, ReplicaError, SLOT_KEY};

/// How to treat a room that already holds data when this device also does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JoinStrategy {
    /// Keep the room's data and drop this device's.
    #[default]
    PreferRemote,
    /// Replace the room's data with this device's.
    PreferLocal,
    /// Keep both, by record id. The room wins when both hold the same id.
    Merge,
}

impl JoinStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinStrategy::PreferRemote => "remote",
            JoinStrategy::PreferLocal => "local",
            JoinStrategy::Merge => "merge",
        }
    }
}

impl fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JoinStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "remote" | "prefer-remote" => Ok(JoinStrategy::PreferRemote),
            "local" | "prefer-local" => Ok(JoinStrategy::PreferLocal),
            "merge" => Ok(JoinStrategy::Merge),
            _ => Err(format!(
                "Invalid join strategy: {}. Valid values: remote, local, merge",
                s
            )),
        }
    }
}

/// Outcome of reconciling a device with a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapDecision {
    /// Neither side had data.
    KeepEmpty,
    /// The device's data replaced the room's.
    RestoreLocal,
    /// Both sides were combined.
    Merge,
    /// The room's data was kept as loaded.
    AcceptRemote,
}

impl BootstrapDecision {
    /// Whether the reconciled replica must be pushed back to the room.
    pub fn needs_save(&self) -> bool {
        matches!(self, BootstrapDecision::RestoreLocal | BootstrapDecision::Merge)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapDecision::KeepEmpty => "keep-empty",
            BootstrapDecision::RestoreLocal => "restore-local",
            BootstrapDecision::Merge => "merge",
            BootstrapDecision::AcceptRemote => "accept-remote",
        }
    }
}

impl fmt::Display for BootstrapDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the decision for a join.
pub fn decide(local_had_data: bool, remote_had_data: bool, strategy: JoinStrategy) -> BootstrapDecision {
    match (local_had_data, remote_had_data, strategy) {
        (false, false, _) => BootstrapDecision::KeepEmpty,
        (true, false, _) => BootstrapDecision::RestoreLocal,
        (false, true, _) => BootstrapDecision::AcceptRemote,
        (true, true, JoinStrategy::Merge) => BootstrapDecision::Merge,
        (true, true, JoinStrategy::PreferLocal) => BootstrapDecision::RestoreLocal,
        (true, true, JoinStrategy::PreferRemote) => BootstrapDecision::AcceptRemote,
    }
}

/// Every container of a replica exactly as stored, including records and
/// fields the typed models do not read.
struct Contents {
    lists: Vec<(NodeKey, Vec<JsonValue>)>,
    slot: JsonValue,
}

impl Contents {
    fn read(replica: &Replica) -> Result<Self, ReplicaError> {
        let mut lists = Vec::with_capacity(NodeKey::LISTS.len());
        for node in NodeKey::LISTS {
            let items = match replica.read_node(node)? {
                JsonValue::Array(items) => items,
                _ => Vec::new(),
            };
            lists.push((node, items));
        }
        Ok(Self {
            lists,
            slot: replica.read_node(NodeKey::FeedingInProgress)?,
        })
    }

    fn record_count(&self) -> usize {
        self.lists.iter().map(|(_, items)| items.len()).sum::<usize>()
            + usize::from(!self.slot.is_null())
    }

    fn write_slot(&self, replica: &Replica) -> Result<(), ReplicaError> {
        replica.change(Origin::Remote, NodeKey::FeedingInProgress, |doc, obj| {
            Ok(json::put_value(doc, obj, SLOT_KEY, &self.slot)?)
        })
    }

    /// Makes the replica hold exactly these contents.
    fn restore(&self, replica: &Replica) -> Result<(), ReplicaError> {
        for (node, items) in &self.lists {
            replica.change(Origin::Remote, *node, |doc, obj| {
                Ok(json::list_replace(doc, obj, items)?)
            })?;
        }
        if replica.read_node(NodeKey::FeedingInProgress)? != self.slot {
            self.write_slot(replica)?;
        }
        Ok(())
    }

    /// Adds every record the replica does not hold yet, tagged with
    /// `device_id`. Records the replica already holds keep its version and
    /// nothing is removed. Returns how many records were added.
    fn merge_into(&self, replica: &Replica, device_id: &str) -> Result<usize, ReplicaError> {
        let mut added = 0;
        for (node, items) in &self.lists {
            let tagged: Vec<JsonValue> = items
                .iter()
                .cloned()
                .map(|mut item| {
                    if let Some(fields) = item.as_object_mut() {
                        fields.insert("deviceId".to_string(), JsonValue::from(device_id));
                    }
                    item
                })
                .collect();
            added += replica.change(Origin::Remote, *node, |doc, obj| {
                Ok(json::list_append_missing(doc, obj, &tagged)?)
            })?;
        }
        if !self.slot.is_null() && replica.read_node(NodeKey::FeedingInProgress)?.is_null() {
            self.write_slot(replica)?;
            added += 1;
        }
        Ok(added)
    }
}

/// Reconciles `replica` with the room behind `remote`.
///
/// Reconciliation works on the stored documents, so records the typed
/// models cannot read are carried along like any other. Nothing is written
/// to the replica or the room once `cancel` has fired.
pub async fn bootstrap(
    replica: &Replica,
    remote: &mut dyn RemotePersister,
    strategy: JoinStrategy,
    device_id: &str,
    cancel: &CancelToken,
) -> Result<BootstrapDecision, SyncError> {
    let local = Contents::read(replica)?;
    let local_had_data = !replica.is_empty()?;

    let doc = remote.load().await?;
    cancel.check()?;
    replica.replace(doc, Origin::Remote)?;

    let remote_had_data = !replica.is_empty()?;
    let decision = decide(local_had_data, remote_had_data, strategy);
    tracing::info!(
        "Bootstrap decision {} (local {} records, room {} records, strategy {})",
        decision,
        local.record_count(),
        Contents::read(replica)?.record_count(),
        strategy
    );

    match decision {
        BootstrapDecision::RestoreLocal => local.restore(replica)?,
        BootstrapDecision::Merge => {
            let added = local.merge_into(replica, device_id)?;
            tracing::debug!("Merged {} local records into the room", added);
        }
        BootstrapDecision::KeepEmpty | BootstrapDecision::AcceptRemote => {}
    }

    if decision.needs_save() {
        cancel.check()?;
        remote.save(replica).await?;
    }
    Ok(decision)
}
