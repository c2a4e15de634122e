//! SQLite-backed key store.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

use crate::crypto::{IdentityKeyPair, SessionKey, SessionKeyMaterial, SESSION_KEY_SIZE};
use crate::error::{Error, Result};

use super::schema;

/// Durable store for one user's identity key pair and session keys.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct KeyStore {
    conn: Arc<Mutex<Connection>>,
}

impl KeyStore {
    /// Open or create a key store.
    ///
    /// If `path` is None, creates an in-memory store (useful for testing
    /// and for degraded operation when the disk is unavailable).
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| Error::Storage(format!("failed to open key store: {}", e)))?,
            None => Connection::open_in_memory()
                .map_err(|e| Error::Storage(format!("failed to create in-memory store: {}", e)))?,
        };

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::Storage(format!("failed to create tables: {}", e)))?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| Error::Storage(format!("failed to set schema version: {}", e)))?;
                tracing::info!(version = schema::SCHEMA_VERSION, "Key store schema created");
            }
            Some(v) => {
                tracing::debug!(version = v, "Key store schema present");
            }
        }

        Ok(())
    }

    // ========================================================================
    // IDENTITY KEYS
    // ========================================================================

    /// Persist an identity key pair, overwriting any existing pair for
    /// the user.
    pub fn persist_identity(&self, user_id: &str, pair: &IdentityKeyPair) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO identity_keys (user_id, secret_key, public_key, generated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 secret_key = excluded.secret_key,
                 public_key = excluded.public_key,
                 generated_at = excluded.generated_at",
            params![
                user_id,
                hex::encode(pair.secret_bytes()),
                pair.public_key_string(),
                pair.generated_at(),
            ],
        )
        .map_err(|e| Error::Storage(format!("failed to persist identity: {}", e)))?;
        Ok(())
    }

    /// Load the stored identity key pair for a user.
    /// Returns `None` (not an error) when none is stored.
    pub fn load_identity(&self, user_id: &str) -> Result<Option<IdentityKeyPair>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT secret_key, generated_at FROM identity_keys WHERE user_id = ?",
                params![user_id],
                |row| {
                    let secret: String = row.get(0)?;
                    let generated_at: i64 = row.get(1)?;
                    Ok((secret, generated_at))
                },
            )
            .optional()
            .map_err(|e| Error::Storage(format!("failed to load identity: {}", e)))?;

        match row {
            Some((secret_hex, generated_at)) => {
                let bytes = hex::decode(&secret_hex)
                    .map_err(|e| Error::Storage(format!("corrupt identity key: {}", e)))?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| Error::Storage("corrupt identity key: wrong length".into()))?;
                Ok(Some(IdentityKeyPair::from_secret_bytes(bytes, generated_at)))
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // SESSION KEYS
    // ========================================================================

    /// Upsert a session key by id.
    pub fn persist_session_key(&self, key: &SessionKey) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO session_keys (id, conversation_id, key_material, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 conversation_id = excluded.conversation_id,
                 key_material = excluded.key_material,
                 created_at = excluded.created_at,
                 expires_at = excluded.expires_at",
            params![
                key.id,
                key.conversation_id,
                hex::encode(key.material().as_bytes()),
                key.created_at,
                key.expires_at,
            ],
        )
        .map_err(|e| Error::Storage(format!("failed to persist session key: {}", e)))?;
        Ok(())
    }

    /// Load a session key by id.
    pub fn load_session_key(&self, id: &str) -> Result<Option<SessionKey>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, conversation_id, key_material, created_at, expires_at
                 FROM session_keys WHERE id = ?",
                params![id],
                Self::row_to_session_key_parts,
            )
            .optional()
            .map_err(|e| Error::Storage(format!("failed to load session key: {}", e)))?;

        row.map(Self::parts_to_session_key).transpose()
    }

    /// Among the stored keys for a conversation, load the one with the
    /// greatest creation time whose expiry is after `now_ms`.
    pub fn load_latest_valid_session_key(
        &self,
        conversation_id: &str,
        now_ms: i64,
    ) -> Result<Option<SessionKey>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, conversation_id, key_material, created_at, expires_at
                 FROM session_keys
                 WHERE conversation_id = ? AND expires_at > ?
                 ORDER BY created_at DESC
                 LIMIT 1",
                params![conversation_id, now_ms],
                Self::row_to_session_key_parts,
            )
            .optional()
            .map_err(|e| Error::Storage(format!("failed to query session keys: {}", e)))?;

        row.map(Self::parts_to_session_key).transpose()
    }

    /// Delete all session keys whose expiry is at or before `now_ms`.
    ///
    /// Best-effort cleanup: failures are logged, never propagated to the
    /// caller. Returns the number of keys removed.
    pub fn purge_expired(&self, now_ms: i64) -> usize {
        let conn = self.conn.lock();
        match conn.execute(
            "DELETE FROM session_keys WHERE expires_at <= ?",
            params![now_ms],
        ) {
            Ok(purged) => {
                if purged > 0 {
                    tracing::debug!(count = purged, "Purged expired session keys");
                }
                purged
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to purge expired session keys");
                0
            }
        }
    }

    /// Wipe all persisted key material (identity and session keys).
    /// Invoked on logout.
    pub fn clear_all(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM session_keys", [])
            .map_err(|e| Error::Storage(format!("failed to clear session keys: {}", e)))?;
        conn.execute("DELETE FROM identity_keys", [])
            .map_err(|e| Error::Storage(format!("failed to clear identity keys: {}", e)))?;
        Ok(())
    }

    // ========================================================================
    // ROW MAPPING
    // ========================================================================

    fn row_to_session_key_parts(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<(String, String, String, i64, i64)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
        ))
    }

    fn parts_to_session_key(
        (id, conversation_id, material_hex, created_at, expires_at): (
            String,
            String,
            String,
            i64,
            i64,
        ),
    ) -> Result<SessionKey> {
        let bytes = hex::decode(&material_hex)
            .map_err(|e| Error::Storage(format!("corrupt session key material: {}", e)))?;
        let bytes: [u8; SESSION_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::Storage("corrupt session key material: wrong length".into()))?;

        Ok(SessionKey::new(
            id,
            conversation_id,
            SessionKeyMaterial::from_bytes(bytes),
            created_at,
            expires_at,
        ))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_session_key, SESSION_KEY_TTL_MS};

    fn store() -> KeyStore {
        KeyStore::open(None).unwrap()
    }

    #[test]
    fn test_identity_persist_and_load() {
        let store = store();
        let pair = IdentityKeyPair::generate(1000);

        store.persist_identity("alice", &pair).unwrap();
        let loaded = store.load_identity("alice").unwrap().unwrap();

        assert_eq!(loaded.public_bytes(), pair.public_bytes());
        assert_eq!(loaded.secret_bytes(), pair.secret_bytes());
        assert_eq!(loaded.generated_at(), 1000);
    }

    #[test]
    fn test_identity_absent_is_none() {
        let store = store();
        assert!(store.load_identity("nobody").unwrap().is_none());
    }

    #[test]
    fn test_identity_overwrite() {
        let store = store();
        let first = IdentityKeyPair::generate(1);
        let second = IdentityKeyPair::generate(2);

        store.persist_identity("alice", &first).unwrap();
        store.persist_identity("alice", &second).unwrap();

        let loaded = store.load_identity("alice").unwrap().unwrap();
        assert_eq!(loaded.public_bytes(), second.public_bytes());
    }

    #[test]
    fn test_session_key_round_trip() {
        let store = store();
        let key = generate_session_key("alice-bob", 5000);

        store.persist_session_key(&key).unwrap();
        let loaded = store.load_session_key(&key.id).unwrap().unwrap();

        assert_eq!(loaded.id, key.id);
        assert_eq!(loaded.conversation_id, "alice-bob");
        assert_eq!(loaded.material(), key.material());
        assert_eq!(loaded.created_at, key.created_at);
        assert_eq!(loaded.expires_at, key.expires_at);
    }

    #[test]
    fn test_latest_valid_picks_newest_unexpired() {
        let store = store();

        let old = generate_session_key("c", 1_000);
        let newer = generate_session_key("c", 2_000);
        let other_conv = generate_session_key("d", 3_000);
        store.persist_session_key(&old).unwrap();
        store.persist_session_key(&newer).unwrap();
        store.persist_session_key(&other_conv).unwrap();

        let latest = store
            .load_latest_valid_session_key("c", 2_500)
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, newer.id);
    }

    #[test]
    fn test_latest_valid_skips_expired() {
        let store = store();
        let key = generate_session_key("c", 1_000);
        store.persist_session_key(&key).unwrap();

        // Past expiry there is no valid key
        let past_expiry = 1_000 + SESSION_KEY_TTL_MS;
        assert!(store
            .load_latest_valid_session_key("c", past_expiry)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_purge_expired() {
        let store = store();
        let expired = generate_session_key("c", 0);
        let live = generate_session_key("c", SESSION_KEY_TTL_MS);
        store.persist_session_key(&expired).unwrap();
        store.persist_session_key(&live).unwrap();

        let purged = store.purge_expired(SESSION_KEY_TTL_MS);
        assert_eq!(purged, 1);

        assert!(store.load_session_key(&expired.id).unwrap().is_none());
        assert!(store.load_session_key(&live.id).unwrap().is_some());
    }

    #[test]
    fn test_clear_all() {
        let store = store();
        let pair = IdentityKeyPair::generate(1);
        let key = generate_session_key("c", 1);
        store.persist_identity("alice", &pair).unwrap();
        store.persist_session_key(&key).unwrap();

        store.clear_all().unwrap();

        assert!(store.load_identity("alice").unwrap().is_none());
        assert!(store.load_session_key(&key.id).unwrap().is_none());
    }

    #[test]
    fn test_on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let path = path.to_str().unwrap();

        let pair = IdentityKeyPair::generate(7);
        {
            let store = KeyStore::open(Some(path)).unwrap();
            store.persist_identity("alice", &pair).unwrap();
        }

        let store = KeyStore::open(Some(path)).unwrap();
        let loaded = store.load_identity("alice").unwrap().unwrap();
        assert_eq!(loaded.public_bytes(), pair.public_bytes());
    }
}
