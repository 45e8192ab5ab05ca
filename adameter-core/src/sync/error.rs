//! Sync error types.

use thiserror::Error;

use crate::replica::ReplicaError;

/// Errors that can occur while talking to the relay.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No relay URL is configured
    #[error("Sync not configured. Set relay_url in config or ADAMETER_RELAY_URL.")]
    NotConfigured,
    /// Failed to connect to the relay
    #[error("Connection error: {0}")]
    Connection(String),
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    /// HTTP error while probing the relay
    #[error("HTTP error: {0}")]
    Http(String),
    /// Sync protocol error
    #[error("Sync protocol error: {0}")]
    Protocol(String),
    /// CBOR encoding/decoding error
    #[error("CBOR error: {0}")]
    Cbor(String),
    /// Handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),
    /// Handshake timeout
    #[error("Handshake timed out")]
    HandshakeTimeout,
    /// The relay reported an error
    #[error("Relay error: {0}")]
    Relay(String),
    /// The connection closed mid-exchange
    #[error("Relay connection closed")]
    Disconnected,
    /// The session was torn down
    #[error("Sync cancelled")]
    Cancelled,
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}
