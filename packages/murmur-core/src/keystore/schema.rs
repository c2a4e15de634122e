//! Key store schema definitions.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create all tables (for fresh stores)
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

-- One identity key pair per user. Secret bytes are hex-encoded; the
-- public string form is what gets published to the key directory.
CREATE TABLE IF NOT EXISTS identity_keys (
    user_id TEXT PRIMARY KEY,
    secret_key TEXT NOT NULL,
    public_key TEXT NOT NULL,
    generated_at INTEGER NOT NULL
);

-- Conversation session keys, upserted by id.
CREATE TABLE IF NOT EXISTS session_keys (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    key_material TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_keys_conversation
    ON session_keys(conversation_id);
"#;
