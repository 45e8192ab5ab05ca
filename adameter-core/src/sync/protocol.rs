//! Relay wire protocol.
//!
//! Every WebSocket frame is one CBOR-encoded [`RelayMessage`]. A client
//! opens `/rooms/<room>`, sends `join`, and waits for the relay's `peer`
//! answer. After that both sides exchange `sync` messages carrying Automerge
//! sync-protocol payloads until one of them sends `leave` or closes.

use serde::{Deserialize, Serialize};

/// Sender id the relay uses for itself.
pub const RELAY_PEER_ID: &str = "relay";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayMessage {
    /// Sent by a client to open the exchange
    Join {
        #[serde(rename = "senderId")]
        sender_id: String,
        room: String,
    },
    /// Sent by the relay to accept a join
    Peer {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "targetId")]
        target_id: String,
    },
    /// Automerge sync message for the room document
    Sync {
        room: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Sent by a client before disconnecting
    Leave {
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    Error { message: String },
}

impl RelayMessage {
    /// Encode message as CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// Decode message from CBOR bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(data)
    }
}

/// Generate a random peer ID for this connection.
pub fn generate_peer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_peer_id() {
        let id1 = generate_peer_id();
        let id2 = generate_peer_id();
        assert_ne!(id1, id2);
        assert!(uuid::Uuid::parse_str(&id1).is_ok());
    }

    #[test]
    fn test_sync_message_keeps_payload() {
        let msg = RelayMessage::Sync {
            room: "family__epoch__2".to_string(),
            data: vec![0, 1, 2, 255],
        };
        let decoded = RelayMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_wire_field_names() {
        let msg = RelayMessage::Peer {
            sender_id: RELAY_PEER_ID.to_string(),
            target_id: "client".to_string(),
        };
        let value: ciborium::Value = ciborium::from_reader(msg.encode().unwrap().as_slice()).unwrap();
        let map = value.as_map().unwrap();
        let keys: Vec<&str> = map.iter().filter_map(|(k, _)| k.as_text()).collect();
        assert!(keys.contains(&"type"));
        assert!(keys.contains(&"senderId"));
        assert!(keys.contains(&"targetId"));

        let tag = map
            .iter()
            .find(|(k, _)| k.as_text() == Some("type"))
            .and_then(|(_, v)| v.as_text());
        assert_eq!(tag, Some("peer"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(RelayMessage::decode(&[0xff, 0x00, 0x13]).is_err());
    }
}
