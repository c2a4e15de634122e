//! # Public-Key Directory Client
//!
//! Interface to the external directory service that maps user ids to
//! published public keys. The transport behind it (HTTP against the relay
//! in production) is a collaborator; the core only defines the contract
//! and caches results in the [`crate::session::SessionKeyManager`].
//!
//! Lookup semantics: `Ok(None)` means the peer has not published a key —
//! a normal negative result, the caller cannot encrypt to that peer yet.
//! `Err(DirectoryLookup)` means the lookup itself failed and may be
//! retried.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A published public key together with the time it was generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyRecord {
    /// The user's public key in its string form
    pub public_key: String,
    /// Unix millis when the key pair was generated
    pub key_generated_at: i64,
}

/// Directory of users' published public keys.
#[async_trait]
pub trait PublicKeyDirectory: Send + Sync {
    /// Publish (or replace) the caller's public key.
    async fn publish(&self, user_id: &str, public_key: &str, generated_at: i64) -> Result<()>;

    /// Fetch one user's published key. `None` if nothing is published.
    async fn get(&self, user_id: &str) -> Result<Option<PublicKeyRecord>>;

    /// Fetch several users' published keys. Users with no published key
    /// are omitted from the result.
    async fn get_many(&self, user_ids: &[String]) -> Result<HashMap<String, PublicKeyRecord>>;
}

/// In-memory directory, used by tests and local demos.
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: RwLock<HashMap<String, PublicKeyRecord>>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PublicKeyDirectory for InMemoryDirectory {
    async fn publish(&self, user_id: &str, public_key: &str, generated_at: i64) -> Result<()> {
        self.entries.write().insert(
            user_id.to_string(),
            PublicKeyRecord {
                public_key: public_key.to_string(),
                key_generated_at: generated_at,
            },
        );
        Ok(())
    }

    async fn get(&self, user_id: &str) -> Result<Option<PublicKeyRecord>> {
        Ok(self.entries.read().get(user_id).cloned())
    }

    async fn get_many(&self, user_ids: &[String]) -> Result<HashMap<String, PublicKeyRecord>> {
        let entries = self.entries.read();
        Ok(user_ids
            .iter()
            .filter_map(|id| entries.get(id).map(|r| (id.clone(), r.clone())))
            .collect())
    }
}
