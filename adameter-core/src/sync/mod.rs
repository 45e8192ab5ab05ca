//! Sync with the adameter relay.
//!
//! ## Protocol
//!
//! 1. Connect to `<relay>/rooms/<room>` (no authentication; the room name
//!    is the shared secret)
//! 2. Send `join` message with peer ID
//! 3. Receive `peer` message from the relay
//! 4. Exchange `sync` messages carrying Automerge sync payloads
//! 5. Messages are CBOR-encoded
//!
//! Sessions talk to the relay only through [`RelayConnector`] and
//! [`RemotePersister`], so tests can substitute an in-memory relay.

mod bootstrap;
mod client;
mod error;
mod protocol;
mod session;
#[cfg(test)]
pub(crate) mod testing;
mod transport;

pub use bootstrap::{bootstrap, decide, BootstrapDecision, JoinStrategy};
pub use client::{build_http_url, build_ws_url, check_relay, RelayHealth, WsConnector, WsPersister};
pub use error::SyncError;
pub use protocol::{generate_peer_id, RelayMessage, RELAY_PEER_ID};
pub use session::{
    BootstrapHook, JoinMode, SessionConfig, SessionHandle, SessionState, SyncSession,
};
pub use transport::{CancelToken, RelayConnector, RemotePersister};
