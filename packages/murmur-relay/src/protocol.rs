//! Relay protocol message definitions.
//!
//! The relay speaks a simple JSON-over-WebSocket protocol. Encrypted
//! message bodies are opaque to the relay — all E2E encryption happens
//! client-side; the relay only validates envelope shape, persists, and
//! fans out.

use serde::{Deserialize, Serialize};

use murmur_core::codec::{ChatMessage, MessageType};

use crate::store::UserProfile;

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Send a chat message to another user.
    SendMessage {
        /// The message, with optional envelope fields when encrypted
        message: ChatMessage,
    },

    /// Ping to keep the connection alive.
    Ping,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A newly persisted message, delivered to sender and receiver.
    ReceiveMessage {
        /// The persisted message enriched with participant profiles
        message: DeliveredMessage,
    },

    /// Pong response to keep the connection alive.
    Pong,

    /// Error response (validation failure, persistence failure).
    Error {
        /// Human-readable description
        message: String,
    },
}

/// A persisted message enriched with the sender's and receiver's public
/// profile fields, as delivered over the socket and returned by the
/// history endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredMessage {
    /// Server-assigned message id
    pub id: String,
    /// Sender's public profile
    pub sender: UserProfile,
    /// Receiver's public profile
    pub receiver: UserProfile,
    /// Payload kind
    pub message_type: MessageType,
    /// Text body (plaintext or ciphertext) or gif URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// File reference, for file messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Whether `message` is ciphertext
    #[serde(default)]
    pub encrypted: bool,
    /// Envelope: session key id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key_id: Option<String>,
    /// Envelope: wrapped session key (first use only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_session_key: Option<String>,
    /// Envelope: base64 IV
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    /// Server-assigned millis timestamp
    pub timestamp: i64,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_format() {
        let json = r#"{
            "type": "send_message",
            "message": {
                "sender": "alice",
                "receiver": "bob",
                "messageType": "text",
                "message": "hi"
            }
        }"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ClientMessage::SendMessage { message } => {
                assert_eq!(message.sender, "alice");
                assert_eq!(message.receiver, "bob");
                assert_eq!(message.message_type, MessageType::Text);
            }
            other => panic!("expected SendMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_server_message_tags() {
        let pong = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(pong["type"], "pong");

        let err = serde_json::to_value(ServerMessage::Error {
            message: "nope".into(),
        })
        .unwrap();
        assert_eq!(err["type"], "error");
        assert_eq!(err["message"], "nope");
    }
}
