//! Device identity.
//!
//! Every installation gets one opaque id, created on first use and kept in
//! the flat key-value store for as long as that store lives. Records touched
//! by this device are tagged with it.

use uuid::Uuid;

use crate::kv::KeyValueStore;

/// Key under which the device id is stored.
pub const DEVICE_ID_KEY: &str = "deviceId";

/// Id returned when there is no persistent storage to keep an id in.
pub const SERVER_DEVICE_ID: &str = "server";

/// Returns the stored device id, creating and storing one if needed.
///
/// With no store (a headless or server context) this returns
/// [`SERVER_DEVICE_ID`]. A store that fails to read is treated as empty and
/// a store that fails to write still yields the freshly generated id, so this
/// never fails.
pub fn get_device_id(store: Option<&dyn KeyValueStore>) -> String {
    let Some(store) = store else {
        return SERVER_DEVICE_ID.to_string();
    };

    match store.get(DEVICE_ID_KEY) {
        Ok(Some(id)) if !id.is_empty() => return id,
        Ok(_) => {}
        Err(e) => tracing::warn!("Failed to read device id: {}", e),
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = store.set(DEVICE_ID_KEY, &id) {
        tracing::warn!("Failed to persist device id: {}", e);
    }
    tracing::info!("Generated device id {}", id);
    id
}
