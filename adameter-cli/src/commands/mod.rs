mod config_cmd;
mod device;
mod epoch;
mod record;
mod room;
mod sync_cmd;

use std::sync::Arc;
use std::time::Duration;

use adameter_core::sync::RelayConnector;
use adameter_core::{
    AppContext, ContextError, ContextOptions, SessionHandle, SessionState, SyncError, WsConnector,
};
use clap::ValueEnum;

use crate::config::Config;

pub use config_cmd::ConfigCommand;
pub use device::DeviceCommand;
pub use epoch::EpochCommand;
pub use record::RecordCommand;
pub use room::RoomCommand;
pub use sync_cmd::SyncCommand;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// How long a one-shot join waits for the room to answer.
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

pub(crate) async fn open_context(config: &Config) -> Result<AppContext, ContextError> {
    AppContext::open(
        ContextOptions::new(config.data_dir.value.clone())
            .with_autosave_debounce(config.autosave_debounce()),
    )
    .await
}

pub(crate) fn connector(config: &Config) -> Result<Arc<dyn RelayConnector>, SyncError> {
    let url = config
        .relay_url
        .value
        .as_ref()
        .ok_or(SyncError::NotConfigured)?;
    Ok(Arc::new(WsConnector::new(url.clone())))
}

/// Waits until `session` is syncing. Fails if the first connection attempt
/// ends disconnected or the room does not answer in time.
pub(crate) async fn wait_until_syncing(session: &SessionHandle) -> Result<(), String> {
    let mut states = session.subscribe_state();
    let wait = async {
        let mut attempted = false;
        loop {
            match *states.borrow_and_update() {
                SessionState::Syncing => return Ok(()),
                SessionState::Connecting | SessionState::Bootstrapping => attempted = true,
                SessionState::Disconnected if attempted => {
                    return Err(format!("Could not sync with room {}", session.room()))
                }
                SessionState::Disconnected => {}
            }
            if states.changed().await.is_err() {
                return Err("Sync session ended".to_string());
            }
        }
    };
    tokio::time::timeout(JOIN_TIMEOUT, wait)
        .await
        .map_err(|_| format!("Timed out waiting for room {}", session.room()))?
}
