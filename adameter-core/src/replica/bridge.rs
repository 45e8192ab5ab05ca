//! Two-way binding between an in-memory view and a replica node.
//!
//! A bound view pushes a typed change onto a channel for every mutation.
//! The binding task applies those changes to the replica under its own
//! origin, and refreshes the view from the replica whenever a change with
//! any other origin touches the node. Changes tagged with the binding's own
//! origin are ignored, so a local write never comes back to its view.
//!
//! Refreshing holds the view lock while it drains pending local changes
//! into the replica and reads the node back, so a mutation racing with an
//! inbound update is never lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use automerge::{AutoCommit, ObjId};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{NodeKey, Origin, Replica, ReplicaError, ReplicaEvent};

static NEXT_BINDING_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0} is already bound")]
    AlreadyBound(NodeKey),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

/// An in-memory view that can be bound to a replica node.
pub trait Bindable: Send + Sync + 'static {
    type Change: Send + 'static;

    /// The replica node this view mirrors.
    fn node(&self) -> NodeKey;

    /// Starts sending changes to `changes`. Fails if already attached.
    fn attach(&self, changes: mpsc::UnboundedSender<Self::Change>) -> Result<(), BridgeError>;

    /// Stops sending changes. Idempotent.
    fn detach(&self);

    /// Replaces the view contents with the JSON produced by `read`, holding
    /// the view lock for the duration. Emits no change.
    fn refresh(
        &self,
        read: &mut dyn FnMut() -> Result<JsonValue, ReplicaError>,
    ) -> Result<(), ReplicaError>;

    /// Applies one change to the node object `obj`.
    fn write(doc: &mut AutoCommit, obj: &ObjId, change: Self::Change) -> Result<(), ReplicaError>;
}

struct Control {
    stop: oneshot::Sender<()>,
    flush: mpsc::UnboundedSender<oneshot::Sender<()>>,
    detach: Box<dyn Fn() + Send + Sync>,
}

/// A live binding. Unbinds when dropped.
pub struct Binding {
    id: u64,
    node: NodeKey,
    control: Mutex<Option<Control>>,
}

impl Binding {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> NodeKey {
        self.node
    }

    pub fn is_bound(&self) -> bool {
        self.control
            .lock()
            .map(|control| control.is_some())
            .unwrap_or(false)
    }

    /// Waits until every change made to the view before this call has been
    /// written to the replica and the view reflects the replica.
    ///
    /// Returns immediately once unbound.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let sent = match self.control.lock() {
            Ok(control) => control
                .as_ref()
                .is_some_and(|control| control.flush.send(ack_tx).is_ok()),
            Err(_) => false,
        };
        if sent {
            let _ = ack_rx.await;
        }
    }

    /// Stops propagation in both directions. Safe to call repeatedly.
    pub fn unbind(&self) {
        let control = match self.control.lock() {
            Ok(mut control) => control.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(control) = control {
            (control.detach)();
            let _ = control.stop.send(());
            tracing::debug!("Unbound {} (binding {})", self.node, self.id);
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.unbind();
    }
}

/// Binds `view` to its node in `replica`.
///
/// The view is first refreshed from the replica. Must be called from within
/// a Tokio runtime.
pub fn bind<B: Bindable>(view: Arc<B>, replica: &Replica) -> Result<Binding, BridgeError> {
    let node = view.node();
    let (changes_tx, mut changes) = mpsc::unbounded_channel();
    view.attach(changes_tx)?;

    let id = NEXT_BINDING_ID.fetch_add(1, Ordering::Relaxed);
    let events = replica.subscribe();
    if let Err(e) = resync(view.as_ref(), replica, id, &mut changes) {
        view.detach();
        return Err(e.into());
    }

    let (stop_tx, stop_rx) = oneshot::channel();
    let (flush_tx, flush_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(
        view.clone(),
        replica.clone(),
        id,
        changes,
        events,
        stop_rx,
        flush_rx,
    ));

    let detach_view = view.clone();
    tracing::debug!("Bound {} (binding {})", node, id);
    Ok(Binding {
        id,
        node,
        control: Mutex::new(Some(Control {
            stop: stop_tx,
            flush: flush_tx,
            detach: Box::new(move || detach_view.detach()),
        })),
    })
}

fn apply<B: Bindable>(replica: &Replica, id: u64, node: NodeKey, change: B::Change) {
    if let Err(e) = replica.change(Origin::Binding(id), node, |doc, obj| {
        B::write(doc, obj, change)
    }) {
        tracing::warn!("Failed to write {} change to replica: {}", node, e);
    }
}

fn resync<B: Bindable>(
    view: &B,
    replica: &Replica,
    id: u64,
    changes: &mut mpsc::UnboundedReceiver<B::Change>,
) -> Result<(), ReplicaError> {
    let node = view.node();
    view.refresh(&mut || {
        while let Ok(change) = changes.try_recv() {
            apply::<B>(replica, id, node, change);
        }
        replica.read_node(node)
    })
}

async fn run<B: Bindable>(
    view: Arc<B>,
    replica: Replica,
    id: u64,
    mut changes: mpsc::UnboundedReceiver<B::Change>,
    mut events: broadcast::Receiver<ReplicaEvent>,
    mut stop: oneshot::Receiver<()>,
    mut flushes: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
) {
    let node = view.node();
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            change = changes.recv() => match change {
                Some(change) => apply::<B>(&replica, id, node, change),
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) if event.origin == Origin::Binding(id) || !event.touches(node) => {}
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    if let Err(e) = resync(view.as_ref(), &replica, id, &mut changes) {
                        tracing::warn!("Failed to refresh {} from replica: {}", node, e);
                    }
                }
                Err(RecvError::Closed) => break,
            },
            Some(ack) = flushes.recv() => {
                if let Err(e) = resync(view.as_ref(), &replica, id, &mut changes) {
                    tracing::warn!("Failed to refresh {} from replica: {}", node, e);
                }
                let _ = ack.send(());
            }
        }
    }
}

/// All bindings of one replica, flushed and released together.
#[derive(Default)]
pub struct BindingSet {
    bindings: Vec<Binding>,
}

impl BindingSet {
    pub fn new(bindings: Vec<Binding>) -> Self {
        Self { bindings }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub async fn flush(&self) {
        for binding in &self.bindings {
            binding.flush().await;
        }
    }

    pub fn unbind(&self) {
        for binding in &self.bindings {
            binding.unbind();
        }
    }
}
