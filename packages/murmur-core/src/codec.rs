//! # Message Codec
//!
//! The wire shape of a chat message and the mapping between plaintext
//! send-intent and the encrypted envelope.
//!
//! ## Wire Format
//!
//! ```text
//! {
//!   "sender": "...",                     // user id
//!   "receiver": "...",                   // user id
//!   "messageType": "text" | "gif" | "file",
//!   "message": "...",                    // plaintext, URL, or base64 ciphertext
//!   "fileUrl": "...",                    // file messages only
//!   "encrypted": true,
//!   "sessionKeyId": "uuid",              // present iff encrypted
//!   "iv": "base64 (12 raw bytes)",       // present iff encrypted
//!   "encryptedSessionKey": "base64",     // only on first use of a key
//!   "timestamp": 1700000000000           // server-assigned millis
//! }
//! ```
//!
//! Only text bodies are ever encrypted. Gif and file messages carry a bare
//! URL/reference and pass through untouched.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, EncryptedPayload, SessionKey, SessionKeyMaterial};
use crate::error::{Error, Result};

/// Chat message payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Plain or encrypted text body
    Text,
    /// GIF reference (URL), never encrypted
    Gif,
    /// Uploaded file reference, never encrypted
    File,
}

impl MessageType {
    /// Database string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Gif => "gif",
            Self::File => "file",
        }
    }

    /// Parse from the database string form
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "gif" => Some(Self::Gif),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// Encryption metadata attached to a chat message.
///
/// Invariant: a `session_key_id` in an envelope must resolve to a session
/// key either already known locally or recoverable via the accompanying
/// wrapped key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    /// Base64 ciphertext of the message body
    pub ciphertext: String,
    /// Base64 IV (12 raw bytes)
    pub iv: String,
    /// Id of the session key the body was encrypted under
    pub session_key_id: String,
    /// The session key wrapped for the recipient; present only when the
    /// sender believes the recipient has not yet seen this key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_session_key: Option<String>,
}

/// A chat message as sent over the socket and persisted by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned id; absent until persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Sender user id
    pub sender: String,
    /// Receiver user id
    pub receiver: String,
    /// Payload kind
    pub message_type: MessageType,
    /// Text body (plaintext or base64 ciphertext) or gif URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// File reference, for file messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Whether `message` is ciphertext
    #[serde(default)]
    pub encrypted: bool,
    /// Envelope: session key id (present iff encrypted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key_id: Option<String>,
    /// Envelope: wrapped session key (first use only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_session_key: Option<String>,
    /// Envelope: base64 IV (present iff encrypted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    /// Server-assigned millis timestamp; absent until persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChatMessage {
    /// A plaintext text message.
    pub fn text(sender: &str, receiver: &str, body: &str) -> Self {
        Self {
            id: None,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            message_type: MessageType::Text,
            message: Some(body.to_string()),
            file_url: None,
            encrypted: false,
            session_key_id: None,
            encrypted_session_key: None,
            iv: None,
            timestamp: None,
        }
    }

    /// A gif message carrying a bare URL.
    pub fn gif(sender: &str, receiver: &str, url: &str) -> Self {
        Self {
            message_type: MessageType::Gif,
            ..Self::text(sender, receiver, url)
        }
    }

    /// A file message referencing an uploaded file.
    pub fn file(sender: &str, receiver: &str, file_url: &str) -> Self {
        Self {
            message_type: MessageType::File,
            message: None,
            file_url: Some(file_url.to_string()),
            ..Self::text(sender, receiver, "")
        }
    }

    /// Attach an encrypted envelope, replacing the plaintext body.
    pub fn with_envelope(mut self, envelope: EncryptedEnvelope) -> Self {
        self.message = Some(envelope.ciphertext);
        self.encrypted = true;
        self.session_key_id = Some(envelope.session_key_id);
        self.encrypted_session_key = envelope.encrypted_session_key;
        self.iv = Some(envelope.iv);
        self
    }

    /// The envelope carried by this message, if it is well-formed.
    pub fn envelope(&self) -> Option<EncryptedEnvelope> {
        if !is_envelope_encrypted(self) {
            return None;
        }
        Some(EncryptedEnvelope {
            ciphertext: self.message.clone()?,
            iv: self.iv.clone()?,
            session_key_id: self.session_key_id.clone()?,
            encrypted_session_key: self.encrypted_session_key.clone(),
        })
    }
}

/// Whether a message declares itself encrypted AND carries ciphertext,
/// an IV, and a session-key id. Consumers use this to decide whether to
/// route through decryption or use the raw field.
pub fn is_envelope_encrypted(message: &ChatMessage) -> bool {
    message.encrypted
        && message.message.as_deref().is_some_and(|m| !m.is_empty())
        && message.iv.as_deref().is_some_and(|iv| !iv.is_empty())
        && message
            .session_key_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
}

/// Validate a message before sending or persisting.
///
/// Enforces the schema invariant: an encrypted message must carry a
/// non-empty session-key id and IV; a receiver must always be present.
pub fn validate_for_send(message: &ChatMessage) -> Result<()> {
    if message.receiver.is_empty() {
        return Err(Error::InvalidMessage("message has no receiver".into()));
    }
    if message.encrypted {
        let missing_key = message
            .session_key_id
            .as_deref()
            .map_or(true, |id| id.is_empty());
        let missing_iv = message.iv.as_deref().map_or(true, |iv| iv.is_empty());
        if missing_key || missing_iv {
            return Err(Error::InvalidMessage(
                "encrypted message missing sessionKeyId or iv".into(),
            ));
        }
    }
    match message.message_type {
        MessageType::Text | MessageType::Gif => {
            if message.message.as_deref().map_or(true, |m| m.is_empty()) {
                return Err(Error::InvalidMessage("message body is empty".into()));
            }
        }
        MessageType::File => {
            if message.file_url.as_deref().map_or(true, |u| u.is_empty()) {
                return Err(Error::InvalidMessage("file message has no fileUrl".into()));
            }
        }
    }
    Ok(())
}

/// Encrypt a plaintext body into an outbound envelope.
///
/// `wrapped_key_for_recipient` is attached only when the sender believes
/// the recipient has not yet seen this session key; subsequent messages
/// in the window omit it to keep payloads small.
pub fn build_outbound_envelope(
    plaintext: &str,
    session_key: &SessionKey,
    wrapped_key_for_recipient: Option<String>,
) -> Result<EncryptedEnvelope> {
    let EncryptedPayload { ciphertext, iv } = crypto::encrypt(plaintext, session_key.material())?;
    Ok(EncryptedEnvelope {
        ciphertext,
        iv,
        session_key_id: session_key.id.clone(),
        encrypted_session_key: wrapped_key_for_recipient,
    })
}

/// Decrypt an inbound envelope with already-resolved key material.
pub fn open_inbound_envelope(
    envelope: &EncryptedEnvelope,
    material: &SessionKeyMaterial,
) -> Result<String> {
    crypto::decrypt(&envelope.ciphertext, &envelope.iv, material)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_session_key;

    #[test]
    fn test_envelope_round_trip() {
        let key = generate_session_key("alice-bob", 1_000);

        let envelope = build_outbound_envelope("hello", &key, None).unwrap();
        assert_eq!(envelope.session_key_id, key.id);
        assert!(envelope.encrypted_session_key.is_none());

        let plaintext = open_inbound_envelope(&envelope, key.material()).unwrap();
        assert_eq!(plaintext, "hello");
    }

    #[test]
    fn test_envelope_carries_wrapped_key_when_given() {
        let key = generate_session_key("alice-bob", 1_000);
        let envelope =
            build_outbound_envelope("hello", &key, Some("wrapped-blob".into())).unwrap();
        assert_eq!(envelope.encrypted_session_key.as_deref(), Some("wrapped-blob"));
    }

    #[test]
    fn test_is_envelope_encrypted_predicate() {
        let key = generate_session_key("c", 0);
        let envelope = build_outbound_envelope("hi", &key, None).unwrap();
        let msg = ChatMessage::text("a", "b", "hi").with_envelope(envelope);
        assert!(is_envelope_encrypted(&msg));

        // Plain message is not
        assert!(!is_envelope_encrypted(&ChatMessage::text("a", "b", "hi")));

        // Declared encrypted but missing iv is not
        let mut broken = msg.clone();
        broken.iv = None;
        assert!(!is_envelope_encrypted(&broken));

        // Declared encrypted but empty session key id is not
        let mut broken = msg;
        broken.session_key_id = Some(String::new());
        assert!(!is_envelope_encrypted(&broken));
    }

    #[test]
    fn test_validate_for_send() {
        assert!(validate_for_send(&ChatMessage::text("a", "b", "hi")).is_ok());

        let mut no_receiver = ChatMessage::text("a", "", "hi");
        no_receiver.receiver = String::new();
        assert!(validate_for_send(&no_receiver).is_err());

        let mut bad_envelope = ChatMessage::text("a", "b", "hi");
        bad_envelope.encrypted = true;
        assert!(validate_for_send(&bad_envelope).is_err());

        let mut empty_body = ChatMessage::text("a", "b", "hi");
        empty_body.message = None;
        assert!(validate_for_send(&empty_body).is_err());

        assert!(validate_for_send(&ChatMessage::file("a", "b", "https://x/f.png")).is_ok());
        let mut no_url = ChatMessage::file("a", "b", "");
        no_url.file_url = None;
        assert!(validate_for_send(&no_url).is_err());
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let key = generate_session_key("c", 0);
        let envelope = build_outbound_envelope("hi", &key, Some("wk".into())).unwrap();
        let msg = ChatMessage::text("a", "b", "hi").with_envelope(envelope);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["messageType"], "text");
        assert_eq!(json["encrypted"], true);
        assert!(json["sessionKeyId"].is_string());
        assert!(json["encryptedSessionKey"].is_string());
        assert!(json["iv"].is_string());
        // Absent optionals are omitted, not nulled
        assert!(json.get("fileUrl").is_none());
        assert!(json.get("timestamp").is_none());
    }

    #[test]
    fn test_gif_message_parses_without_envelope_fields() {
        let json = r#"{
            "sender": "a",
            "receiver": "b",
            "messageType": "gif",
            "message": "https://giphy.example/x.gif"
        }"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.message_type, MessageType::Gif);
        assert!(!msg.encrypted);
        assert!(!is_envelope_encrypted(&msg));
    }
}
