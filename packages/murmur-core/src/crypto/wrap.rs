//! # Session-Key Wrapping
//!
//! Sealed-box encryption of session-key material under a recipient's
//! public identity key, used to introduce a session key to a peer.
//!
//! ```text
//! wrap:    ephemeral X25519 keypair
//!          shared  = ECDH(ephemeral_secret, recipient_public)
//!          wrapkey = HKDF-SHA256(ikm = shared,
//!                                salt = ephemeral_pub || recipient_pub,
//!                                info = "murmur-session-key-wrap-v1")
//!          out     = base64(ephemeral_pub || nonce || AES-GCM(wrapkey, material))
//!
//! unwrap:  shared  = ECDH(own_secret, ephemeral_pub)   — same secret
//!          then derive and decrypt as above
//! ```
//!
//! The ephemeral keypair is used for exactly one wrap and discarded, so a
//! wrapped blob is decryptable only by the holder of the recipient's
//! private identity key.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce as AesNonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::error::{Error, Result};

use super::encryption::{SessionKeyMaterial, IV_SIZE, SESSION_KEY_SIZE};
use super::keys::{IdentityKeyPair, PublicWrapKey, PUBLIC_KEY_SIZE};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

const WRAP_INFO: &[u8] = b"murmur-session-key-wrap-v1";

/// AES-GCM auth tag length.
const TAG_SIZE: usize = 16;

/// Minimum decoded length of a wrapped blob:
/// ephemeral public key + nonce + ciphertext(material + tag).
const WRAPPED_MIN_LEN: usize = PUBLIC_KEY_SIZE + IV_SIZE + SESSION_KEY_SIZE + TAG_SIZE;

fn derive_wrap_key(
    shared: &[u8; 32],
    ephemeral_pub: &[u8; 32],
    recipient_pub: &[u8; 32],
) -> Result<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_pub);
    salt[32..].copy_from_slice(recipient_pub);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; 32];
    hkdf.expand(WRAP_INFO, &mut key)
        .map_err(|_| Error::CryptoUnsupported("HKDF expansion failed".into()))?;
    Ok(key)
}

/// Wrap session-key material for a recipient.
///
/// Returns a transport-safe base64 string. Fails with [`Error::WrapFailed`]
/// if the recipient's public key is unusable.
pub fn wrap_session_key(
    material: &SessionKeyMaterial,
    recipient_public: &PublicWrapKey,
) -> Result<String> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = X25519PublicKey::from(&ephemeral).to_bytes();

    let their_public = X25519PublicKey::from(*recipient_public.as_bytes());
    let shared = ephemeral.diffie_hellman(&their_public).to_bytes();

    let wrap_key = derive_wrap_key(&shared, &ephemeral_pub, recipient_public.as_bytes())?;

    let cipher = Aes256Gcm::new_from_slice(&wrap_key)
        .map_err(|e| Error::CryptoUnsupported(format!("AES-256-GCM unavailable: {}", e)))?;

    let mut nonce = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(AesNonce::from_slice(&nonce), material.as_bytes().as_ref())
        .map_err(|e| Error::WrapFailed(format!("{}", e)))?;

    let mut out = Vec::with_capacity(PUBLIC_KEY_SIZE + IV_SIZE + ciphertext.len());
    out.extend_from_slice(&ephemeral_pub);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

/// Unwrap session-key material with the local identity's private key.
///
/// Fails with [`Error::UnwrapFailed`] on a malformed blob, a corrupted
/// payload, or the wrong key. Callers must treat the failure as permanent
/// for that envelope — the blob will never decrypt on retry.
pub fn unwrap_session_key(wrapped: &str, own: &IdentityKeyPair) -> Result<SessionKeyMaterial> {
    let blob = BASE64
        .decode(wrapped.trim())
        .map_err(|e| Error::UnwrapFailed(format!("wrapped key is not valid base64: {}", e)))?;

    if blob.len() < WRAPPED_MIN_LEN {
        return Err(Error::UnwrapFailed(format!(
            "wrapped key too short: {} bytes",
            blob.len()
        )));
    }

    let ephemeral_pub: [u8; PUBLIC_KEY_SIZE] = blob[..PUBLIC_KEY_SIZE]
        .try_into()
        .map_err(|_| Error::UnwrapFailed("malformed wrapped key header".into()))?;
    let nonce = &blob[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + IV_SIZE];
    let ciphertext = &blob[PUBLIC_KEY_SIZE + IV_SIZE..];

    let shared = own.diffie_hellman(&ephemeral_pub);
    let wrap_key = derive_wrap_key(&shared, &ephemeral_pub, &own.public_bytes())?;

    let cipher = Aes256Gcm::new_from_slice(&wrap_key)
        .map_err(|e| Error::CryptoUnsupported(format!("AES-256-GCM unavailable: {}", e)))?;

    let material = cipher
        .decrypt(AesNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::UnwrapFailed("authentication tag mismatch".into()))?;

    let material: [u8; SESSION_KEY_SIZE] = material
        .try_into()
        .map_err(|_| Error::UnwrapFailed("unwrapped material has wrong length".into()))?;

    Ok(SessionKeyMaterial::from_bytes(material))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let recipient = IdentityKeyPair::generate(1);
        let material = SessionKeyMaterial::generate();

        let recipient_public =
            PublicWrapKey::from_string(&recipient.public_key_string()).unwrap();
        let wrapped = wrap_session_key(&material, &recipient_public).unwrap();
        let unwrapped = unwrap_session_key(&wrapped, &recipient).unwrap();

        assert_eq!(unwrapped.as_bytes(), material.as_bytes());
    }

    #[test]
    fn test_wrap_is_randomized() {
        let recipient = IdentityKeyPair::generate(1);
        let material = SessionKeyMaterial::generate();
        let public = PublicWrapKey::from_bytes(recipient.public_bytes());

        // Fresh ephemeral key + nonce per wrap: same input, different blobs
        let a = wrap_session_key(&material, &public).unwrap();
        let b = wrap_session_key(&material, &public).unwrap();
        assert_ne!(a, b);

        assert_eq!(
            unwrap_session_key(&a, &recipient).unwrap().as_bytes(),
            unwrap_session_key(&b, &recipient).unwrap().as_bytes()
        );
    }

    #[test]
    fn test_unwrap_with_wrong_key_fails() {
        let recipient = IdentityKeyPair::generate(1);
        let eavesdropper = IdentityKeyPair::generate(1);
        let material = SessionKeyMaterial::generate();

        let public = PublicWrapKey::from_bytes(recipient.public_bytes());
        let wrapped = wrap_session_key(&material, &public).unwrap();

        let result = unwrap_session_key(&wrapped, &eavesdropper);
        assert!(matches!(result, Err(Error::UnwrapFailed(_))));
    }

    #[test]
    fn test_unwrap_corrupted_blob_fails() {
        let recipient = IdentityKeyPair::generate(1);
        let material = SessionKeyMaterial::generate();
        let public = PublicWrapKey::from_bytes(recipient.public_bytes());

        let wrapped = wrap_session_key(&material, &public).unwrap();
        let mut blob = BASE64.decode(&wrapped).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;

        let result = unwrap_session_key(&BASE64.encode(&blob), &recipient);
        assert!(matches!(result, Err(Error::UnwrapFailed(_))));
    }

    #[test]
    fn test_unwrap_garbage_fails() {
        let recipient = IdentityKeyPair::generate(1);
        assert!(matches!(
            unwrap_session_key("definitely not base64 !!!", &recipient),
            Err(Error::UnwrapFailed(_))
        ));
        assert!(matches!(
            unwrap_session_key(&BASE64.encode(b"too short"), &recipient),
            Err(Error::UnwrapFailed(_))
        ));
    }
}
