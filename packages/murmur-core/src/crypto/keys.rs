//! # Identity Keys
//!
//! The identity key pair is a long-lived X25519 keypair generated once per
//! user per device. Its only job is wrapping and unwrapping conversation
//! session keys — message bodies are never encrypted under it directly.
//!
//! The public half is serialized to a base64 string and published to the
//! public-key directory so peers can wrap session keys for this user. The
//! private half stays inside the [`crate::keystore::KeyStore`] and this
//! type; it is never transmitted.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Size of X25519 public keys in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Long-lived asymmetric identity key pair.
///
/// Generated once per user per device and reused across sessions.
#[derive(Clone, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    /// Private key (secret)
    #[zeroize(skip)] // StaticSecret handles its own zeroization
    secret: StaticSecret,
    /// Public key (derived from secret)
    #[zeroize(skip)]
    public: X25519PublicKey,
    /// Unix millis when this pair was generated
    generated_at: i64,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair.
    ///
    /// Uses the operating system's secure random number generator.
    pub fn generate(now_ms: i64) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self {
            secret,
            public,
            generated_at: now_ms,
        }
    }

    /// Reconstruct a key pair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32], generated_at: i64) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519PublicKey::from(&secret);
        Self {
            secret,
            public,
            generated_at,
        }
    }

    /// Get the secret key bytes (for local persistence only).
    ///
    /// ## Security Warning
    ///
    /// Only use this for secure storage. Never log or transmit these bytes.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// The serializable public-key representation published to the
    /// directory (base64 of the 32 raw bytes).
    pub fn public_key_string(&self) -> String {
        BASE64.encode(self.public.to_bytes())
    }

    /// Unix millis when this pair was generated
    pub fn generated_at(&self) -> i64 {
        self.generated_at
    }

    /// Perform Diffie-Hellman key exchange with a peer public key.
    ///
    /// Both sides of an exchange compute the same shared secret:
    /// `own_secret × their_public == their_secret × own_public`.
    pub(crate) fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let their_public = X25519PublicKey::from(*their_public);
        self.secret.diffie_hellman(&their_public).to_bytes()
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secret material must not leak through Debug output.
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_key_string())
            .field("generated_at", &self.generated_at)
            .finish_non_exhaustive()
    }
}

/// A peer's published public key, parsed from its directory string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicWrapKey([u8; PUBLIC_KEY_SIZE]);

impl PublicWrapKey {
    /// Parse a public key from its published base64 string form.
    pub fn from_string(s: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(s.trim())
            .map_err(|e| Error::InvalidKey(format!("public key is not valid base64: {}", e)))?;
        let bytes: [u8; PUBLIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("public key must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Encode back to the published string form
    pub fn to_string_form(&self) -> String {
        BASE64.encode(self.0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
