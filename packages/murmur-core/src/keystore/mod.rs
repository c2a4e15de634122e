//! # Key Store
//!
//! Durable, local, per-user persistence of the identity key pair and
//! conversation session keys.
//!
//! Backed by SQLite. Identity lookups are keyed by user id, session-key
//! lookups by key id, with a secondary non-unique index on conversation
//! id for the "latest valid key for this conversation" query.

mod database;
mod schema;

pub use database::KeyStore;
