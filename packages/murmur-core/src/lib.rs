//! # Murmur Core
//!
//! Client-side core for the Murmur chat application: the end-to-end
//! encrypted messaging session protocol.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        MURMUR CORE MODULES                          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────────────┐    │
//! │  │   Session    │──►│   Crypto     │   │      Codec            │    │
//! │  │ Key Manager  │   │              │   │                       │    │
//! │  │              │   │ - X25519     │   │ - ChatMessage wire    │    │
//! │  │ - get/create │   │ - AES-GCM    │   │ - EncryptedEnvelope   │    │
//! │  │ - resolve    │   │ - wrap/unwrap│   │ - validate invariants │    │
//! │  │ - clear_all  │   └──────────────┘   └───────────────────────┘    │
//! │  └──────┬───────┘                                                   │
//! │         │                                                           │
//! │         ├──────────────┬──────────────────┐                         │
//! │         ▼              ▼                  ▼                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────────┐   │
//! │  │  Key Store   │  │  Directory   │  │  Relay (separate crate)  │   │
//! │  │  (SQLite)    │  │  (trait)     │  │  murmur-relay            │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────────┘   │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A sender obtains the current session key for the conversation (Session
//! Key Manager, consulting the Key Store and the public-key directory),
//! encrypts the plaintext (Crypto), and attaches the resulting envelope
//! (Codec) to the message it emits toward the relay. On receipt, the
//! recipient unwraps the embedded session key with its private identity
//! key if the key is unfamiliar, then decrypts the body.

#![warn(missing_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod codec;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod keystore;
pub mod session;
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use codec::{ChatMessage, EncryptedEnvelope, MessageType};
pub use crypto::{IdentityKeyPair, SessionKey, SESSION_KEY_TTL_MS};
pub use directory::{InMemoryDirectory, PublicKeyDirectory, PublicKeyRecord};
pub use error::{Error, Result};
pub use keystore::KeyStore;
pub use session::{
    conversation_id, DecryptFailure, IncomingContent, OutboundMessage, PlaintextReason,
    SessionKeyManager,
};
