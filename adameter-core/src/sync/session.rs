//! A live sync session with one room.
//!
//! The session task connects, bootstraps on the first successful
//! connection, and then syncs until the handle is torn down. A failed or
//! dropped connection is not retried on its own: the session waits in
//! `Disconnected` until a visibility or focus trigger arrives. A trigger
//! while syncing reconnects and reloads the room to catch up.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::bootstrap::{bootstrap, BootstrapDecision, JoinStrategy};
use super::error::SyncError;
use super::transport::{CancelToken, RelayConnector, RemotePersister};
use crate::replica::{Origin, Replica};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Bootstrapping,
    Syncing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Bootstrapping => write!(f, "bootstrapping"),
            SessionState::Syncing => write!(f, "syncing"),
        }
    }
}

/// How the first connection treats existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Reconcile with the room using the given strategy.
    Bootstrap(JoinStrategy),
    /// The room was reconciled before; merge its document in.
    Resume,
}

/// Called once with the outcome of a successful bootstrap.
pub type BootstrapHook = Box<dyn FnOnce(BootstrapDecision) + Send>;

/// What a session needs to know about the room it joins.
pub struct SessionConfig {
    pub room: String,
    pub join: JoinMode,
    pub device_id: String,
    pub on_bootstrapped: Option<BootstrapHook>,
}

impl SessionConfig {
    pub fn new(room: impl Into<String>, join: JoinMode, device_id: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            join,
            device_id: device_id.into(),
            on_bootstrapped: None,
        }
    }

    pub fn on_bootstrapped(mut self, hook: impl FnOnce(BootstrapDecision) + Send + 'static) -> Self {
        self.on_bootstrapped = Some(Box::new(hook));
        self
    }
}

struct Inner {
    room: String,
    state: watch::Receiver<SessionState>,
    decision: Mutex<Option<BootstrapDecision>>,
    trigger: Notify,
    cancel: CancelToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running session. Clones refer to the same session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

pub struct SyncSession;

impl SyncSession {
    /// Starts a session task. Must be called from within a Tokio runtime.
    pub fn start(
        config: SessionConfig,
        replica: Replica,
        connector: Arc<dyn RelayConnector>,
    ) -> SessionHandle {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let inner = Arc::new(Inner {
            room: config.room.clone(),
            state: state_rx,
            decision: Mutex::new(None),
            trigger: Notify::new(),
            cancel: CancelToken::new(),
            task: tokio::sync::Mutex::new(None),
        });

        let task = SessionTask {
            inner: inner.clone(),
            state: state_tx,
            replica,
            connector,
            join: config.join,
            device_id: config.device_id,
            on_bootstrapped: config.on_bootstrapped,
        };
        let handle = tokio::spawn(task.run());
        if let Ok(mut slot) = inner.task.try_lock() {
            *slot = Some(handle);
        }

        tracing::info!("Sync session started for room {}", config.room);
        SessionHandle { inner }
    }
}

impl SessionHandle {
    pub fn room(&self) -> &str {
        &self.inner.room
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.clone()
    }

    /// The decision of the bootstrap this session ran, if it ran one.
    pub fn last_decision(&self) -> Option<BootstrapDecision> {
        *self
            .inner
            .decision
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// The application became visible again.
    pub fn notify_visible(&self) {
        self.trigger("visibility");
    }

    /// The application regained focus.
    pub fn notify_focus(&self) {
        self.trigger("focus");
    }

    /// Triggers count only while the session is idle or syncing.
    fn trigger(&self, reason: &str) {
        match self.state() {
            SessionState::Disconnected | SessionState::Syncing if !self.is_torn_down() => {
                self.inner.trigger.notify_one();
            }
            state => tracing::debug!("Ignoring {} trigger while {}", reason, state),
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Waits until the session reaches `state` or ends.
    pub async fn wait_for(&self, state: SessionState) -> SessionState {
        let mut rx = self.subscribe_state();
        let current = match rx.wait_for(|s| *s == state || self.is_torn_down()).await {
            Ok(current) => *current,
            Err(_) => SessionState::Disconnected,
        };
        current
    }

    /// Stops the session and waits for its task to finish. Nothing the task
    /// had in flight is applied afterwards. Safe to call repeatedly.
    pub async fn teardown(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Sync session task for {} failed: {}", self.inner.room, e);
            }
            tracing::info!("Sync session for room {} torn down", self.inner.room);
        }
    }
}

/// Why a connection ended without an error.
enum Ended {
    Cancelled,
    Reconnect,
}

struct SessionTask {
    inner: Arc<Inner>,
    state: watch::Sender<SessionState>,
    replica: Replica,
    connector: Arc<dyn RelayConnector>,
    join: JoinMode,
    device_id: String,
    on_bootstrapped: Option<BootstrapHook>,
}

impl SessionTask {
    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    async fn run(mut self) {
        let cancel = self.inner.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.set_state(SessionState::Connecting);

            match self.connect_and_sync().await {
                Ok(Ended::Reconnect) => continue,
                Ok(Ended::Cancelled) | Err(SyncError::Cancelled) => break,
                Err(e) => tracing::warn!("Sync with room {} failed: {}", self.inner.room, e),
            }

            self.set_state(SessionState::Disconnected);
            tokio::select! {
                _ = self.inner.trigger.notified() => {}
                _ = cancel.cancelled() => break,
            }
        }
        self.set_state(SessionState::Disconnected);
    }

    /// Runs one connection. The transport is closed however it ends,
    /// including on teardown.
    async fn connect_and_sync(&mut self) -> Result<Ended, SyncError> {
        let cancel = self.inner.cancel.clone();
        let mut remote = tokio::select! {
            remote = self.connector.connect(&self.inner.room) => remote?,
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        };
        let result = tokio::select! {
            result = self.sync_with(remote.as_mut(), &cancel) => result,
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, remote.close()).await.is_err() {
            tracing::debug!("Timed out closing connection to {}", self.inner.room);
        }
        result
    }

    async fn sync_with(
        &mut self,
        remote: &mut dyn RemotePersister,
        cancel: &CancelToken,
    ) -> Result<Ended, SyncError> {
        cancel.check()?;
        self.set_state(SessionState::Bootstrapping);

        match self.join {
            JoinMode::Bootstrap(strategy) => {
                let decision = bootstrap(&self.replica, remote, strategy, &self.device_id, cancel).await?;
                *self
                    .inner
                    .decision
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(decision);
                if let Some(hook) = self.on_bootstrapped.take() {
                    hook(decision);
                }
                self.join = JoinMode::Resume;
            }
            JoinMode::Resume => {
                let mut doc = remote.load().await?;
                cancel.check()?;
                let changed = self.replica.merge(&mut doc, Origin::Remote)?;
                tracing::debug!("Reloaded room {} (changed: {})", self.inner.room, changed);
            }
        }

        cancel.check()?;
        self.set_state(SessionState::Syncing);
        tracing::info!("Syncing room {}", self.inner.room);

        tokio::select! {
            result = remote.run(&self.replica, cancel) => {
                result?;
                if cancel.is_cancelled() {
                    Ok(Ended::Cancelled)
                } else {
                    Err(SyncError::Disconnected)
                }
            }
            _ = self.inner.trigger.notified() => {
                tracing::debug!("Reconnecting to room {}", self.inner.room);
                Ok(Ended::Reconnect)
            }
        }
    }
}
