//! Message, profile, and public-key persistence.
//!
//! SQLite-backed store behind the relay. Holds three tables:
//! `messages` (the durable chat history), `users` (public profile fields
//! used to enrich delivered messages), and `public_keys` (the directory
//! peers query before wrapping session keys).
//!
//! The live-connection registry is NOT here — message history is the
//! durable record, the registry in [`crate::state`] is process-local.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use murmur_core::codec::{ChatMessage, MessageType};

/// Store error type.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying database failure
    #[error("database error: {0}")]
    Database(String),

    /// The message is not storable as given
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

type Result<T> = std::result::Result<T, StoreError>;

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Public profile fields attached to delivered messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// User id
    pub user_id: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Avatar URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
    /// Short bio
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl UserProfile {
    /// A profile carrying only the user id, for users who never stored
    /// profile fields.
    pub fn bare(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            name: None,
            user_name: None,
            profile_picture: None,
            bio: None,
        }
    }
}

/// A message as persisted, with server-assigned id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Server-assigned id
    pub id: String,
    /// Sender user id
    pub sender: String,
    /// Receiver user id
    pub receiver: String,
    /// Payload kind
    pub message_type: MessageType,
    /// Text body or gif URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// File reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Whether `message` is ciphertext
    pub encrypted: bool,
    /// Envelope: session key id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key_id: Option<String>,
    /// Envelope: wrapped session key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_session_key: Option<String>,
    /// Envelope: base64 IV
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    /// Server-assigned millis timestamp
    pub timestamp: i64,
}

/// A published public key with its generation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyEntry {
    /// The key in its published string form
    pub public_key: String,
    /// Unix millis when the key pair was generated
    pub key_generated_at: i64,
}

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    sender TEXT NOT NULL,
    receiver TEXT NOT NULL,
    message_type TEXT NOT NULL,
    message TEXT,
    file_url TEXT,
    encrypted INTEGER NOT NULL DEFAULT 0,
    session_key_id TEXT,
    encrypted_session_key TEXT,
    iv TEXT,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_participants
    ON messages(sender, receiver);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp
    ON messages(timestamp);

CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    name TEXT,
    user_name TEXT,
    profile_picture TEXT,
    bio TEXT
);

CREATE TABLE IF NOT EXISTS public_keys (
    user_id TEXT PRIMARY KEY,
    public_key TEXT NOT NULL,
    key_generated_at INTEGER NOT NULL
);
"#;

/// The relay's persistence layer.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl MessageStore {
    /// Open or create the store. `None` creates an in-memory database
    /// (used by tests).
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p).map_err(db_err)?,
            None => Connection::open_in_memory().map_err(db_err)?,
        };
        conn.execute_batch(CREATE_TABLES).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── Messages ─────────────────────────────────────────────────────────

    /// Durably store a message, assigning its id and timestamp.
    ///
    /// A failure here aborts delivery — the relay never fans out a
    /// message that was not durably stored.
    pub fn save_message(&self, message: &ChatMessage) -> Result<StoredMessage> {
        if message.receiver.is_empty() {
            return Err(StoreError::InvalidMessage("message has no receiver".into()));
        }

        let stored = StoredMessage {
            id: Uuid::new_v4().to_string(),
            sender: message.sender.clone(),
            receiver: message.receiver.clone(),
            message_type: message.message_type,
            message: message.message.clone(),
            file_url: message.file_url.clone(),
            encrypted: message.encrypted,
            session_key_id: message.session_key_id.clone(),
            encrypted_session_key: message.encrypted_session_key.clone(),
            iv: message.iv.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages
                 (id, sender, receiver, message_type, message, file_url,
                  encrypted, session_key_id, encrypted_session_key, iv, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                stored.id,
                stored.sender,
                stored.receiver,
                stored.message_type.as_str(),
                stored.message,
                stored.file_url,
                stored.encrypted as i64,
                stored.session_key_id,
                stored.encrypted_session_key,
                stored.iv,
                stored.timestamp,
            ],
        )
        .map_err(db_err)?;

        Ok(stored)
    }

    /// All messages between two users, ascending by timestamp.
    pub fn conversation(&self, user_a: &str, user_b: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, sender, receiver, message_type, message, file_url,
                        encrypted, session_key_id, encrypted_session_key, iv, timestamp
                 FROM messages
                 WHERE (sender = ?1 AND receiver = ?2) OR (sender = ?2 AND receiver = ?1)
                 ORDER BY timestamp ASC, rowid ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![user_a, user_b], |row| {
                let message_type: String = row.get(3)?;
                Ok(StoredMessage {
                    id: row.get(0)?,
                    sender: row.get(1)?,
                    receiver: row.get(2)?,
                    message_type: MessageType::from_str(&message_type)
                        .unwrap_or(MessageType::Text),
                    message: row.get(4)?,
                    file_url: row.get(5)?,
                    encrypted: row.get::<_, i64>(6)? != 0,
                    session_key_id: row.get(7)?,
                    encrypted_session_key: row.get(8)?,
                    iv: row.get(9)?,
                    timestamp: row.get(10)?,
                })
            })
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Number of stored messages (for /stats).
    pub fn message_count(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .unwrap_or(0)
    }

    // ── Profiles ─────────────────────────────────────────────────────────

    /// Create or update a user's public profile fields.
    pub fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (user_id, name, user_name, profile_picture, bio)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 name = excluded.name,
                 user_name = excluded.user_name,
                 profile_picture = excluded.profile_picture,
                 bio = excluded.bio",
            params![
                profile.user_id,
                profile.name,
                profile.user_name,
                profile.profile_picture,
                profile.bio,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Load a user's profile; falls back to a bare profile when the user
    /// never stored one, so enrichment always succeeds.
    pub fn profile(&self, user_id: &str) -> UserProfile {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, name, user_name, profile_picture, bio
             FROM users WHERE user_id = ?",
            params![user_id],
            |row| {
                Ok(UserProfile {
                    user_id: row.get(0)?,
                    name: row.get(1)?,
                    user_name: row.get(2)?,
                    profile_picture: row.get(3)?,
                    bio: row.get(4)?,
                })
            },
        )
        .optional()
        .unwrap_or_else(|e| {
            tracing::warn!(user_id = user_id, error = %e, "Profile lookup failed");
            None
        })
        .unwrap_or_else(|| UserProfile::bare(user_id))
    }

    // ── Public-Key Directory ─────────────────────────────────────────────

    /// Publish (or replace) a user's public key.
    pub fn publish_key(&self, user_id: &str, public_key: &str, generated_at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO public_keys (user_id, public_key, key_generated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 public_key = excluded.public_key,
                 key_generated_at = excluded.key_generated_at",
            params![user_id, public_key, generated_at],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Look up one user's published key.
    pub fn key(&self, user_id: &str) -> Result<Option<PublicKeyEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT public_key, key_generated_at FROM public_keys WHERE user_id = ?",
            params![user_id],
            |row| {
                Ok(PublicKeyEntry {
                    public_key: row.get(0)?,
                    key_generated_at: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    /// Look up several users' published keys; users without a key are
    /// omitted from the result.
    pub fn keys(&self, user_ids: &[String]) -> Result<HashMap<String, PublicKeyEntry>> {
        let mut out = HashMap::new();
        for user_id in user_ids {
            if let Some(entry) = self.key(user_id)? {
                out.insert(user_id.clone(), entry);
            }
        }
        Ok(out)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MessageStore {
        MessageStore::open(None).unwrap()
    }

    #[test]
    fn test_save_assigns_id_and_timestamp() {
        let store = store();
        let stored = store
            .save_message(&ChatMessage::text("alice", "bob", "hi"))
            .unwrap();
        assert!(!stored.id.is_empty());
        assert!(stored.timestamp > 0);
        assert_eq!(stored.sender, "alice");
        assert_eq!(stored.message.as_deref(), Some("hi"));
    }

    #[test]
    fn test_save_rejects_missing_receiver() {
        let store = store();
        let mut msg = ChatMessage::text("alice", "bob", "hi");
        msg.receiver = String::new();
        assert!(matches!(
            store.save_message(&msg),
            Err(StoreError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_conversation_is_symmetric_and_ordered() {
        let store = store();
        store
            .save_message(&ChatMessage::text("alice", "bob", "one"))
            .unwrap();
        store
            .save_message(&ChatMessage::text("bob", "alice", "two"))
            .unwrap();
        store
            .save_message(&ChatMessage::text("alice", "carol", "other thread"))
            .unwrap();

        let history = store.conversation("alice", "bob").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message.as_deref(), Some("one"));
        assert_eq!(history[1].message.as_deref(), Some("two"));

        // Same history regardless of argument order
        let flipped = store.conversation("bob", "alice").unwrap();
        assert_eq!(history, flipped);
    }

    #[test]
    fn test_envelope_fields_round_trip() {
        let store = store();
        let mut msg = ChatMessage::text("alice", "bob", "Y2lwaGVydGV4dA==");
        msg.encrypted = true;
        msg.session_key_id = Some("key-1".into());
        msg.encrypted_session_key = Some("wrapped".into());
        msg.iv = Some("aXZpdml2aXZpdg==".into());

        store.save_message(&msg).unwrap();
        let history = store.conversation("alice", "bob").unwrap();
        assert!(history[0].encrypted);
        assert_eq!(history[0].session_key_id.as_deref(), Some("key-1"));
        assert_eq!(history[0].encrypted_session_key.as_deref(), Some("wrapped"));
        assert_eq!(history[0].iv.as_deref(), Some("aXZpdml2aXZpdg=="));
    }

    #[test]
    fn test_profile_upsert_and_fallback() {
        let store = store();

        // Unknown user gets a bare profile
        let bare = store.profile("ghost");
        assert_eq!(bare, UserProfile::bare("ghost"));

        let profile = UserProfile {
            user_id: "alice".into(),
            name: Some("Alice".into()),
            user_name: Some("alice01".into()),
            profile_picture: Some("https://cdn.example/a.png".into()),
            bio: Some("hello".into()),
        };
        store.upsert_profile(&profile).unwrap();
        assert_eq!(store.profile("alice"), profile);

        // Upsert replaces
        let renamed = UserProfile {
            name: Some("Alice B".into()),
            ..profile
        };
        store.upsert_profile(&renamed).unwrap();
        assert_eq!(store.profile("alice").name.as_deref(), Some("Alice B"));
    }

    #[test]
    fn test_key_directory() {
        let store = store();
        assert!(store.key("alice").unwrap().is_none());

        store.publish_key("alice", "key-a", 100).unwrap();
        store.publish_key("bob", "key-b", 200).unwrap();

        let entry = store.key("alice").unwrap().unwrap();
        assert_eq!(entry.public_key, "key-a");
        assert_eq!(entry.key_generated_at, 100);

        // Republish replaces
        store.publish_key("alice", "key-a2", 300).unwrap();
        assert_eq!(store.key("alice").unwrap().unwrap().public_key, "key-a2");

        let many = store
            .keys(&["alice".into(), "bob".into(), "carol".into()])
            .unwrap();
        assert_eq!(many.len(), 2);
        assert!(!many.contains_key("carol"));
    }

    #[test]
    fn test_gif_and_file_messages_persist() {
        let store = store();
        store
            .save_message(&ChatMessage::gif("a", "b", "https://giphy.example/x.gif"))
            .unwrap();
        store
            .save_message(&ChatMessage::file("a", "b", "https://cdn.example/f.pdf"))
            .unwrap();

        let history = store.conversation("a", "b").unwrap();
        assert_eq!(history[0].message_type, MessageType::Gif);
        assert_eq!(history[1].message_type, MessageType::File);
        assert_eq!(
            history[1].file_url.as_deref(),
            Some("https://cdn.example/f.pdf")
        );
    }
}
