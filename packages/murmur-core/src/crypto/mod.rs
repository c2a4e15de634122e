//! # Cryptography Module
//!
//! Stateless cryptographic primitives for the messaging session protocol.
//!
//! ## Key Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Identity Key Pair (X25519, long-lived, one per user per device)    │
//! │        │                                                            │
//! │        │  wraps / unwraps (sealed box: ECDH + HKDF + AES-GCM)       │
//! │        ▼                                                            │
//! │  Session Key (AES-256-GCM, per conversation, 24h lifetime)          │
//! │        │                                                            │
//! │        │  encrypts / decrypts                                       │
//! │        ▼                                                            │
//! │  Message bodies (ciphertext + 12-byte IV, base64 on the wire)       │
//! │───────────────────────────────────────────────────────────────────── │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The identity key pair never encrypts message bodies directly; it only
//! wraps session keys so a peer can recover them. Everything in this
//! module operates on key material already in memory — persistence lives
//! in [`crate::keystore`], orchestration in [`crate::session`].
//!
//! ## Algorithm Choices
//!
//! | Algorithm | Purpose | Why |
//! |-----------|---------|-----|
//! | X25519 | Identity keys, session-key wrapping | Fast ECDH, small keys |
//! | AES-256-GCM | Message bodies, wrapped keys | AEAD, tampering detected |
//! | HKDF-SHA256 | Wrap-key derivation | Industry standard |

mod encryption;
mod keys;
mod wrap;

pub use encryption::{
    decrypt, encrypt, generate_session_key, EncryptedPayload, SessionKey, SessionKeyMaterial,
    IV_SIZE, SESSION_KEY_SIZE, SESSION_KEY_TTL_MS,
};
pub use keys::{IdentityKeyPair, PublicWrapKey, PUBLIC_KEY_SIZE};
pub use wrap::{unwrap_session_key, wrap_session_key};
