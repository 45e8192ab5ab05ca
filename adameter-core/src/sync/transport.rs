//! The seam between sync sessions and the relay transport.

use std::sync::Arc;

use async_trait::async_trait;
use automerge::AutoCommit;
use tokio::sync::watch;

use super::error::SyncError;
use crate::replica::Replica;

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so this only ends on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// An open link to one room on the relay.
#[async_trait]
pub trait RemotePersister: Send {
    /// Fetches the room's current document.
    async fn load(&mut self) -> Result<AutoCommit, SyncError>;

    /// Pushes every change the relay is missing from `replica`.
    async fn save(&mut self, replica: &Replica) -> Result<(), SyncError>;

    /// Syncs `replica` with the room in both directions until `cancel` fires
    /// (returns `Ok`) or the link fails.
    async fn run(&mut self, replica: &Replica, cancel: &CancelToken) -> Result<(), SyncError>;

    /// Closes the link. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens links to rooms.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, room: &str) -> Result<Box<dyn RemotePersister>, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());

        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }
}
