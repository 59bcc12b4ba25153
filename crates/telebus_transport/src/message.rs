use serde::{Deserialize, Serialize};
use telebus_protocol::{Ack, HealthStatus};

/// Requests an agent sends over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Publish {
        request_id: u64,
        #[serde(with = "telebus_protocol::b64::bytes")]
        envelope: Vec<u8>,
    },
    Health {
        request_id: u64,
    },
}

/// Replies from the broker. Every reply to a request echoes its `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ack {
        request_id: u64,
        ack: Ack,
    },
    Health {
        request_id: u64,
        status: HealthStatus,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        message: String,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> u64 {
        match self {
            ClientMessage::Publish { request_id, .. } | ClientMessage::Health { request_id } => {
                *request_id
            }
        }
    }
}

impl ServerMessage {
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Ack { request_id, .. } | ServerMessage::Health { request_id, .. } => {
                Some(*request_id)
            }
            ServerMessage::Error { request_id, .. } => *request_id,
        }
    }
}

/// Largest WebSocket message accepted for a given envelope limit.
///
/// Envelopes travel base64-encoded, and the frame limit sits well above the
/// envelope limit so that a modestly oversize envelope still reaches the
/// broker and gets a proper `INVALID` instead of a dropped connection.
pub fn ws_message_limit(max_envelope_bytes: usize) -> usize {
    max_envelope_bytes.saturating_mul(3).saturating_add(64 * 1024)
}
