//! # Error Handling
//!
//! Error types for Murmur Core.
//!
//! The general propagation policy: cryptographic and storage errors are
//! caught at the [`crate::session::SessionKeyManager`] boundary and turned
//! into optional results wherever the caller has a sensible unencrypted
//! fallback. Only per-item failures (a single message that will not
//! decrypt) surface past that boundary, and they carry enough context for
//! the UI to show a "decryption failed" placeholder instead of garbage.

use thiserror::Error;

/// Result type alias for Murmur Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Murmur Core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Crypto Errors
    // ========================================================================

    /// The platform cannot provide a required cryptographic primitive.
    /// Fatal to encryption capability for the session; plaintext sends
    /// remain possible and are flagged as unencrypted.
    #[error("cryptographic primitive unavailable: {0}")]
    CryptoUnsupported(String),

    /// Failed to wrap a session key for a recipient
    #[error("failed to wrap session key: {0}")]
    WrapFailed(String),

    /// Failed to unwrap a session key received from a peer.
    /// Permanent for that envelope; never retried.
    #[error("failed to unwrap session key: {0}")]
    UnwrapFailed(String),

    /// Encryption failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication tag mismatch or malformed input)
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Invalid key format or length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    // ========================================================================
    // Storage Errors
    // ========================================================================

    /// Local key persistence unavailable or failed
    #[error("key storage error: {0}")]
    Storage(String),

    // ========================================================================
    // Directory Errors
    // ========================================================================

    /// Public-key directory lookup failed (transient; retryable).
    /// "No key published" is not an error — lookups return `None` for that.
    #[error("public key directory lookup failed: {0}")]
    DirectoryLookup(String),

    // ========================================================================
    // Protocol Errors
    // ========================================================================

    /// A chat message violates the wire invariants (e.g. declared
    /// encrypted without a session-key id or IV).
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
