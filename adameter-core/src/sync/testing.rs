//! In-memory relay used by the sync tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use automerge::AutoCommit;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;

use super::error::SyncError;
use super::transport::{CancelToken, RelayConnector, RemotePersister};
use crate::replica::{self, json, NodeKey, Replica};

/// One room held in memory, with counters for what clients did to it.
#[derive(Clone)]
pub struct MockRelay {
    doc: Arc<Mutex<AutoCommit>>,
    saves: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    load_gate: Option<Arc<Notify>>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self {
            doc: Arc::new(Mutex::new(replica::new_document().unwrap())),
            saves: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            load_gate: None,
        }
    }

    /// Loads block until the returned gate is notified.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.load_gate = Some(gate.clone());
        (self, gate)
    }

    pub fn push(&self, node: NodeKey, record: JsonValue) {
        let mut doc = self.doc.lock().unwrap();
        let obj = replica::node_obj(&doc, node).unwrap();
        json::list_push(&mut doc, &obj, &record).unwrap();
        doc.commit();
    }

    pub fn read(&self, node: NodeKey) -> JsonValue {
        replica::read_node(&self.doc.lock().unwrap(), node).unwrap()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn persister(&self) -> MockPersister {
        MockPersister {
            relay: self.clone(),
        }
    }
}

pub struct MockPersister {
    relay: MockRelay,
}

#[async_trait]
impl RemotePersister for MockPersister {
    async fn load(&mut self) -> Result<AutoCommit, SyncError> {
        if let Some(gate) = &self.relay.load_gate {
            gate.notified().await;
        }
        Ok(self.relay.doc.lock().unwrap().fork())
    }

    async fn save(&mut self, replica: &Replica) -> Result<(), SyncError> {
        self.relay.saves.fetch_add(1, Ordering::SeqCst);
        let mut from_replica = replica.fork();
        self.relay.doc.lock().unwrap().merge(&mut from_replica).unwrap();
        Ok(())
    }

    async fn run(&mut self, _replica: &Replica, cancel: &CancelToken) -> Result<(), SyncError> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn close(&mut self) {
        self.relay.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayConnector for MockRelay {
    async fn connect(&self, _room: &str) -> Result<Box<dyn RemotePersister>, SyncError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.persister()))
    }
}
