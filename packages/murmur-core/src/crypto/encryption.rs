//! # Message Encryption
//!
//! AES-256-GCM encryption of message bodies under per-conversation session
//! keys.
//!
//! A session key is a 256-bit symmetric key scoped to one conversation
//! with a fixed 24-hour lifetime. A conversation accumulates session keys
//! over time as they rotate; at most one is "current" (latest non-expired)
//! at any instant, and every envelope pins the exact key id it was
//! encrypted under, so older messages stay decryptable after rotation.
//!
//! ## Encoding contract
//!
//! All binary blobs cross component boundaries as base64 text. The IV is
//! 12 bytes, the session key 256 bits; the GCM authentication tag rides at
//! the end of the ciphertext with no extra padding.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce as AesNonce,
};
use rand::RngCore;
use uuid::Uuid;
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Size of the AES-GCM IV in bytes (96 bits)
pub const IV_SIZE: usize = 12;

/// Size of session keys in bytes (256 bits)
pub const SESSION_KEY_SIZE: usize = 32;

/// Session key lifetime: 24 hours, in milliseconds.
///
/// Bounds the blast radius of a compromised key without requiring
/// interactive rekeying; the next send after the boundary generates a
/// fresh key.
pub const SESSION_KEY_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Raw session key material.
///
/// Zeroized when dropped. Never reuse an IV with the same material — IV
/// reuse under AES-GCM breaks confidentiality, which is why [`encrypt`]
/// draws a fresh random IV on every call.
#[derive(ZeroizeOnDrop)]
pub struct SessionKeyMaterial([u8; SESSION_KEY_SIZE]);

impl SessionKeyMaterial {
    /// Generate fresh random key material from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl Clone for SessionKeyMaterial {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl PartialEq for SessionKeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl std::fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeyMaterial(..)")
    }
}

/// A symmetric session key scoped to one conversation.
#[derive(Debug, Clone)]
pub struct SessionKey {
    /// Unique identifier (UUID), referenced by envelopes on the wire
    pub id: String,
    /// The conversation this key belongs to
    pub conversation_id: String,
    /// Key material (zeroized on drop)
    material: SessionKeyMaterial,
    /// Unix millis when the key was created
    pub created_at: i64,
    /// Unix millis when the key expires
    pub expires_at: i64,
}

impl SessionKey {
    /// Assemble a session key from its parts (used when loading from
    /// storage or resolving a peer-provided key).
    pub fn new(
        id: String,
        conversation_id: String,
        material: SessionKeyMaterial,
        created_at: i64,
        expires_at: i64,
    ) -> Self {
        Self {
            id,
            conversation_id,
            material,
            created_at,
            expires_at,
        }
    }

    /// Access the raw key material
    pub fn material(&self) -> &SessionKeyMaterial {
        &self.material
    }

    /// Whether the key is still usable at `now_ms`.
    /// Validity is strict: a key expiring exactly at `now_ms` is expired.
    pub fn is_valid(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

/// Generate a fresh session key for a conversation.
///
/// The expiry window is a fixed policy constant ([`SESSION_KEY_TTL_MS`]).
pub fn generate_session_key(conversation_id: &str, now_ms: i64) -> SessionKey {
    SessionKey {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        material: SessionKeyMaterial::generate(),
        created_at: now_ms,
        expires_at: now_ms + SESSION_KEY_TTL_MS,
    }
}

/// An encrypted message body as it appears inside the wire envelope.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncryptedPayload {
    /// Ciphertext with trailing auth tag, base64-encoded
    pub ciphertext: String,
    /// 12-byte IV, base64-encoded
    pub iv: String,
}

/// Encrypt a plaintext message body under a session key.
///
/// Draws a fresh random 12-byte IV per call.
pub fn encrypt(plaintext: &str, key: &SessionKeyMaterial) -> Result<EncryptedPayload> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::CryptoUnsupported(format!("AES-256-GCM unavailable: {}", e)))?;

    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(AesNonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|e| Error::EncryptionFailed(format!("{}", e)))?;

    Ok(EncryptedPayload {
        ciphertext: BASE64.encode(ciphertext),
        iv: BASE64.encode(iv),
    })
}

/// Decrypt a message body.
///
/// Fails with [`Error::DecryptionFailed`] on an authentication-tag
/// mismatch or malformed input — tampering is detected, never silently
/// decoded into garbage.
pub fn decrypt(ciphertext_b64: &str, iv_b64: &str, key: &SessionKeyMaterial) -> Result<String> {
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| Error::DecryptionFailed(format!("ciphertext is not valid base64: {}", e)))?;
    let iv = BASE64
        .decode(iv_b64)
        .map_err(|e| Error::DecryptionFailed(format!("iv is not valid base64: {}", e)))?;

    if iv.len() != IV_SIZE {
        return Err(Error::DecryptionFailed(format!(
            "iv must be {} bytes, got {}",
            IV_SIZE,
            iv.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::CryptoUnsupported(format!("AES-256-GCM unavailable: {}", e)))?;

    let plaintext = cipher
        .decrypt(AesNonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| Error::DecryptionFailed("authentication tag mismatch".into()))?;

    String::from_utf8(plaintext)
        .map_err(|_| Error::DecryptionFailed("decrypted payload is not valid UTF-8".into()))
}

// ============================================================================
// TESTS
// ============================================================================
