//! AdaMeter Relay
//!
//! Relays Automerge sync messages between devices that share a room and
//! keeps each room's document on disk.
//!
//! # Configuration
//!
//! Environment variables:
//! - `ADAMETER_RELAY_PORT`: Port to listen on (default: 8080)
//! - `ADAMETER_RELAY_DATA_DIR`: Directory to store room documents
//!   (default: ~/.local/share/adameter-relay)
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint
//! - `GET /rooms/{room}`: WebSocket sync for one room

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use adameter_relay::server::{app, RoomHub, RoomStorage};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Relay configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    /// Directory to store room documents
    data_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("ADAMETER_RELAY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let data_dir = std::env::var("ADAMETER_RELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("adameter-relay")
            });

        Self { port, data_dir }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adameter_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        tracing::error!("Failed to create data directory: {}", e);
        std::process::exit(1);
    }
    tracing::info!("Data directory: {}", config.data_dir.display());

    let hub = Arc::new(RoomHub::new(RoomStorage::new(&config.data_dir)));
    let app = app(hub).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting relay on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Relay stopped: {}", e);
        std::process::exit(1);
    }
}
