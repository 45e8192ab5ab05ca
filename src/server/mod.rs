//! Relay server: room documents on disk, one sync state per connection and
//! change fan-out between the connections of a room.

pub mod hub;
pub mod storage;
pub mod ws;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

pub use hub::{Room, RoomHub};
pub use storage::{RoomStorage, RoomStorageError};

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Routes served by the relay.
pub fn app(hub: Arc<RoomHub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms/{room}", get(ws::room_handler))
        .with_state(hub)
}
