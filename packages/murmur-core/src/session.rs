//! # Session Key Manager
//!
//! Orchestrates the key lifecycle behind a conversation-oriented API:
//! identity bootstrap, per-conversation session-key lookup/creation/expiry,
//! peer public-key caching, and the one explicit policy decision point for
//! falling back to plaintext.
//!
//! ## Data Flow
//!
//! ```text
//! send:    prepare_outbound(plaintext, recipient)
//!            │  peer key?  ──(none)──► OutboundMessage::Plaintext(reason)
//!            ▼
//!          get_or_create_session_key(conversation)
//!            │  cache → key store → generate fresh
//!            ▼
//!          encrypt + (first use only) wrap for recipient
//!            ▼
//!          OutboundMessage::Encrypted { envelope }
//!
//! receive: open_incoming(message)
//!            │  not encrypted ─────────► IncomingContent::Plaintext
//!            │  wrapped key attached ──► resolve_session_key_from_peer
//!            │  key unknown ──────────► IncomingContent::Failed(KeyUnknown)
//!            ▼
//!          decrypt ── ok ─► Decrypted    ── err ─► Failed(DecryptFailed)
//! ```
//!
//! Storage failures degrade the manager to in-memory-only operation for
//! the process lifetime (keys lost on restart) instead of blocking
//! messaging; directory failures surface as retryable errors. Only
//! per-message decrypt failures reach the caller as failures, and they
//! arrive as observable states rather than panics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::codec::{self, ChatMessage, MessageType};
use crate::crypto::{
    generate_session_key, unwrap_session_key, wrap_session_key, IdentityKeyPair, PublicWrapKey,
    SessionKey, SESSION_KEY_TTL_MS,
};
use crate::directory::{PublicKeyDirectory, PublicKeyRecord};
use crate::error::{Error, Result};
use crate::keystore::KeyStore;
use crate::time::now_timestamp_millis;

/// Derive the deterministic, order-independent conversation identifier
/// for a pair of participants: the sorted pair joined with `-`, so both
/// sides compute the same id independently.
pub fn conversation_id(a: &str, b: &str) -> String {
    let mut pair = [a, b];
    pair.sort_unstable();
    pair.join("-")
}

/// Outcome of the centralized encrypt-or-plaintext policy decision.
///
/// Every send path consults this; falling back to plaintext is always
/// explicit and observable, never silent.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// The body was encrypted; attach this envelope to the outgoing message.
    Encrypted {
        /// Envelope to attach via [`ChatMessage::with_envelope`]
        envelope: codec::EncryptedEnvelope,
        /// The conversation the session key belongs to
        conversation_id: String,
    },
    /// Encryption was not possible; send plaintext, flagged unencrypted.
    Plaintext {
        /// Why encryption was skipped
        reason: PlaintextReason,
    },
}

/// Why an outbound message could not be encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaintextReason {
    /// No identity key pair loaded (not initialized, or cleared on logout)
    NotInitialized,
    /// The recipient has not published a public key yet
    RecipientKeyUnavailable,
}

/// Result of opening an incoming message.
///
/// Failures are per-message observable states — a message that will not
/// decrypt renders as a placeholder, it never aborts the receive pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingContent {
    /// The message was not encrypted; raw body (text or URL)
    Plaintext(String),
    /// Decrypted text body
    Decrypted(String),
    /// The message could not be decrypted
    Failed(DecryptFailure),
}

/// Why an incoming message could not be decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptFailure {
    /// The referenced session key is unknown and no wrapped key was
    /// attached; the peer must resend the wrapped key.
    KeyUnknown,
    /// Authentication or format failure for this message only
    DecryptFailed,
}

#[derive(Default)]
struct ManagerState {
    user_id: Option<String>,
    identity: Option<IdentityKeyPair>,
    /// Session keys by id
    session_keys: HashMap<String, SessionKey>,
    /// Conversation id → current session key id
    conversation_keys: HashMap<String, String>,
    /// Peer public-key cache (read-through over the directory)
    peer_keys: HashMap<String, PublicKeyRecord>,
    /// `"{session_key_id}:{recipient}"` pairs already introduced, so the
    /// wrapped key is only attached on first use
    introduced: HashSet<String>,
}

/// Orchestrates the Key Store, Crypto Engine, and public-key directory
/// behind a conversation-oriented API.
pub struct SessionKeyManager {
    store: KeyStore,
    directory: Arc<dyn PublicKeyDirectory>,
    state: RwLock<ManagerState>,
}

impl SessionKeyManager {
    /// Create a manager over a key store and a directory client.
    pub fn new(store: KeyStore, directory: Arc<dyn PublicKeyDirectory>) -> Self {
        Self {
            store,
            directory,
            state: RwLock::new(ManagerState::default()),
        }
    }

    /// Initialize crypto for a user: load the persisted identity key pair
    /// or generate and persist a fresh one, publish the public half to
    /// the directory, and purge expired session keys.
    ///
    /// A storage failure degrades to in-memory-only keys with a warning;
    /// a directory publish failure is logged and left for retry. Neither
    /// blocks messaging.
    pub async fn initialize(&self, user_id: &str) -> Result<()> {
        let now = now_timestamp_millis();

        let identity = match self.store.load_identity(user_id) {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                let pair = IdentityKeyPair::generate(now);
                if let Err(e) = self.store.persist_identity(user_id, &pair) {
                    tracing::warn!(
                        user_id = user_id,
                        error = %e,
                        "Identity could not be persisted; keys are in-memory only"
                    );
                }
                pair
            }
            Err(e) => {
                tracing::warn!(
                    user_id = user_id,
                    error = %e,
                    "Key store unavailable; generating in-memory identity"
                );
                IdentityKeyPair::generate(now)
            }
        };

        if let Err(e) = self
            .directory
            .publish(user_id, &identity.public_key_string(), identity.generated_at())
            .await
        {
            tracing::warn!(
                user_id = user_id,
                error = %e,
                "Failed to publish public key; peers cannot encrypt to us yet"
            );
        }

        self.store.purge_expired(now);

        let mut state = self.state.write();
        state.user_id = Some(user_id.to_string());
        state.identity = Some(identity);
        tracing::info!(user_id = user_id, "Crypto initialized");
        Ok(())
    }

    /// Whether outbound encryption is currently possible.
    pub fn can_encrypt(&self) -> bool {
        self.state.read().identity.is_some()
    }

    /// The local user's published public key string, if initialized.
    pub fn public_key_string(&self) -> Option<String> {
        self.state
            .read()
            .identity
            .as_ref()
            .map(|pair| pair.public_key_string())
    }

    /// Get the current session key for a conversation, creating and
    /// persisting a fresh one if no valid key exists.
    ///
    /// Repeated calls within the validity window return the same key, so
    /// callers avoid redundant re-wrapping for every message.
    pub fn get_or_create_session_key(&self, conversation_id: &str) -> SessionKey {
        let now = now_timestamp_millis();

        {
            let state = self.state.read();
            if let Some(key) = state
                .conversation_keys
                .get(conversation_id)
                .and_then(|id| state.session_keys.get(id))
            {
                if key.is_valid(now) {
                    return key.clone();
                }
            }
        }

        // Cache miss or expired: consult the store, then generate.
        let key = match self.store.load_latest_valid_session_key(conversation_id, now) {
            Ok(Some(key)) => key,
            Ok(None) => self.create_session_key(conversation_id, now),
            Err(e) => {
                tracing::warn!(
                    conversation_id = conversation_id,
                    error = %e,
                    "Key store read failed; generating in-memory session key"
                );
                self.create_session_key(conversation_id, now)
            }
        };

        let mut state = self.state.write();
        state.session_keys.insert(key.id.clone(), key.clone());
        state
            .conversation_keys
            .insert(conversation_id.to_string(), key.id.clone());
        key
    }

    fn create_session_key(&self, conversation_id: &str, now: i64) -> SessionKey {
        let key = generate_session_key(conversation_id, now);
        if let Err(e) = self.store.persist_session_key(&key) {
            tracing::warn!(
                conversation_id = conversation_id,
                error = %e,
                "Session key could not be persisted; in-memory only"
            );
        }
        tracing::debug!(
            conversation_id = conversation_id,
            session_key_id = key.id.as_str(),
            "Created session key"
        );
        key
    }

    /// Look up a session key by id: cache first, then the key store.
    /// `None` means the caller must ask the peer to resend the wrapped key.
    pub fn get_session_key(&self, id: &str) -> Option<SessionKey> {
        if let Some(key) = self.state.read().session_keys.get(id) {
            return Some(key.clone());
        }
        match self.store.load_session_key(id) {
            Ok(Some(key)) => {
                self.state
                    .write()
                    .session_keys
                    .insert(key.id.clone(), key.clone());
                Some(key)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(session_key_id = id, error = %e, "Key store read failed");
                None
            }
        }
    }

    /// Recover a session key a peer wrapped for us, then persist and
    /// cache it. Called on first receipt of an unfamiliar session-key id.
    ///
    /// The recovered key gets a policy expiry from "now" — the wrapped
    /// blob does not carry the sender's expiry.
    pub fn resolve_session_key_from_peer(
        &self,
        wrapped: &str,
        session_key_id: &str,
        conversation_id: &str,
    ) -> Result<SessionKey> {
        let identity = self
            .state
            .read()
            .identity
            .clone()
            .ok_or_else(|| Error::UnwrapFailed("crypto not initialized".into()))?;

        let material = unwrap_session_key(wrapped, &identity)?;

        let now = now_timestamp_millis();
        let key = SessionKey::new(
            session_key_id.to_string(),
            conversation_id.to_string(),
            material,
            now,
            now + SESSION_KEY_TTL_MS,
        );

        if let Err(e) = self.store.persist_session_key(&key) {
            tracing::warn!(
                session_key_id = session_key_id,
                error = %e,
                "Peer session key could not be persisted; in-memory only"
            );
        }

        let mut state = self.state.write();
        state.session_keys.insert(key.id.clone(), key.clone());
        state
            .conversation_keys
            .entry(conversation_id.to_string())
            .or_insert_with(|| key.id.clone());

        tracing::debug!(
            session_key_id = session_key_id,
            conversation_id = conversation_id,
            "Resolved session key from peer"
        );
        Ok(key)
    }

    /// Fetch a peer's public key: cache first, then the directory.
    ///
    /// `Ok(None)` means the peer has not published a key — the caller
    /// cannot encrypt to them yet. Directory failures are retryable.
    pub async fn fetch_public_key(&self, user_id: &str) -> Result<Option<String>> {
        if let Some(record) = self.state.read().peer_keys.get(user_id) {
            return Ok(Some(record.public_key.clone()));
        }

        match self.directory.get(user_id).await? {
            Some(record) => {
                let key = record.public_key.clone();
                self.state
                    .write()
                    .peer_keys
                    .insert(user_id.to_string(), record);
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// Fetch several peers' public keys at once, caching each result.
    /// Peers with no published key are omitted.
    pub async fn fetch_public_keys(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, String>> {
        let records = self.directory.get_many(user_ids).await?;
        let mut state = self.state.write();
        let mut keys = HashMap::with_capacity(records.len());
        for (user_id, record) in records {
            keys.insert(user_id.clone(), record.public_key.clone());
            state.peer_keys.insert(user_id, record);
        }
        Ok(keys)
    }

    /// Wipe all in-memory and persisted key material for the current
    /// user. Invoked on logout; [`Self::can_encrypt`] reports false until
    /// the next [`Self::initialize`].
    pub fn clear_all(&self) {
        if let Err(e) = self.store.clear_all() {
            tracing::warn!(error = %e, "Failed to clear persisted key material");
        }
        let mut state = self.state.write();
        *state = ManagerState::default();
        tracing::info!("Crypto state cleared");
    }

    // ========================================================================
    // POLICY DECISION POINTS
    // ========================================================================

    /// The single encrypt-or-plaintext decision for outbound sends.
    ///
    /// Returns [`OutboundMessage::Plaintext`] with an explicit reason when
    /// encryption is impossible (no identity, or the recipient has no
    /// published key). Transient directory failures propagate as
    /// [`Error::DirectoryLookup`] so the caller can retry. The wrapped
    /// session key is attached only the first time a session key is used
    /// toward a given recipient.
    pub async fn prepare_outbound(
        &self,
        plaintext: &str,
        recipient_id: &str,
    ) -> Result<OutboundMessage> {
        let own_id = {
            let state = self.state.read();
            match (&state.user_id, &state.identity) {
                (Some(id), Some(_)) => id.clone(),
                _ => {
                    return Ok(OutboundMessage::Plaintext {
                        reason: PlaintextReason::NotInitialized,
                    })
                }
            }
        };

        let recipient_key = match self.fetch_public_key(recipient_id).await? {
            Some(key) => key,
            None => {
                tracing::debug!(
                    recipient = recipient_id,
                    "Recipient has no published key; sending plaintext"
                );
                return Ok(OutboundMessage::Plaintext {
                    reason: PlaintextReason::RecipientKeyUnavailable,
                });
            }
        };

        let conversation = conversation_id(&own_id, recipient_id);
        let session_key = self.get_or_create_session_key(&conversation);

        let introduction = format!("{}:{}", session_key.id, recipient_id);
        let first_use = !self.state.read().introduced.contains(&introduction);

        let wrapped = if first_use {
            let public = PublicWrapKey::from_string(&recipient_key)
                .map_err(|e| Error::WrapFailed(format!("recipient key malformed: {}", e)))?;
            Some(wrap_session_key(session_key.material(), &public)?)
        } else {
            None
        };

        let envelope = codec::build_outbound_envelope(plaintext, &session_key, wrapped)?;

        if first_use {
            self.state.write().introduced.insert(introduction);
        }

        Ok(OutboundMessage::Encrypted {
            envelope,
            conversation_id: conversation,
        })
    }

    /// Open an incoming message: pass through unencrypted bodies, resolve
    /// an attached wrapped key if the session key is unfamiliar, then
    /// decrypt.
    ///
    /// Never returns an error — failures are per-message observable
    /// states ([`IncomingContent::Failed`]) so one bad message cannot
    /// take down message rendering.
    pub fn open_incoming(&self, message: &ChatMessage) -> IncomingContent {
        if !codec::is_envelope_encrypted(message) {
            let raw = match message.message_type {
                MessageType::File => message.file_url.clone(),
                _ => message.message.clone(),
            };
            return IncomingContent::Plaintext(raw.unwrap_or_default());
        }

        // is_envelope_encrypted guarantees the envelope is present
        let envelope = match message.envelope() {
            Some(envelope) => envelope,
            None => return IncomingContent::Failed(DecryptFailure::DecryptFailed),
        };

        // First sight of this key id with a wrapped copy attached:
        // recover it before looking it up.
        if self.get_session_key(&envelope.session_key_id).is_none() {
            if let Some(wrapped) = &envelope.encrypted_session_key {
                let conversation = conversation_id(&message.sender, &message.receiver);
                if let Err(e) = self.resolve_session_key_from_peer(
                    wrapped,
                    &envelope.session_key_id,
                    &conversation,
                ) {
                    tracing::warn!(
                        session_key_id = envelope.session_key_id.as_str(),
                        error = %e,
                        "Failed to recover wrapped session key"
                    );
                }
            }
        }

        let key = match self.get_session_key(&envelope.session_key_id) {
            Some(key) => key,
            None => {
                tracing::debug!(
                    session_key_id = envelope.session_key_id.as_str(),
                    "Session key unknown and no wrapped copy attached"
                );
                return IncomingContent::Failed(DecryptFailure::KeyUnknown);
            }
        };

        match codec::open_inbound_envelope(&envelope, key.material()) {
            Ok(plaintext) => IncomingContent::Decrypted(plaintext),
            Err(e) => {
                tracing::warn!(
                    session_key_id = envelope.session_key_id.as_str(),
                    error = %e,
                    "Message failed to decrypt"
                );
                IncomingContent::Failed(DecryptFailure::DecryptFailed)
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
