//! Cryptographic primitives for `clinvault`.
//!
//! AES-256-GCM authenticated encryption, HKDF-SHA256 key derivation,
//! Argon2id password-based key derivation, and zeroize-on-drop key newtypes.
//! Nothing here holds state.
//!
//! # Formats
//!
//! - [`encrypt`]/[`decrypt`]: `nonce (12) || ciphertext || tag (16)` in one
//!   buffer. Used for barrier records and wrapped master keys.
//! - [`seal_detached`]/[`open_detached`]: ciphertext and IV kept apart with
//!   optional associated data. Used for DEK envelopes, where the IV and the
//!   DEK version are stored next to the ciphertext.

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// AES-256-GCM nonce length (96 bits).
pub const NONCE_LEN: usize = 12;

/// Minimum combined ciphertext length: nonce + tag.
const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + 16;

/// Key length for every symmetric key in the hierarchy.
pub const KEY_LEN: usize = 32;

/// A 256-bit symmetric key, zeroized on drop and redacted in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, which must be exactly 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] for any other length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// Generate a new random key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Borrow the raw key bytes. Never log or persist them.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Ciphertext with its IV kept separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedCiphertext {
    /// Ciphertext including the 16-byte tag.
    pub ciphertext: Vec<u8>,
    /// The 96-bit IV used for this encryption.
    pub iv: [u8; NONCE_LEN],
}

/// Argon2id cost parameters for password-derived keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// The smallest parameters Argon2 accepts. Test and development use only.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Encrypt with a fresh random nonce, returning `nonce || ciphertext || tag`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sealed = seal_detached(key, plaintext, b"")?;
    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(sealed.ciphertext.len()));
    combined.extend_from_slice(&sealed.iv);
    combined.extend_from_slice(&sealed.ciphertext);
    Ok(combined)
}

/// Decrypt a buffer produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] for inputs under 28 bytes and
/// [`CryptoError::Decryption`] if authentication fails.
pub fn decrypt(key: &EncryptionKey, combined: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: combined.len(),
        });
    }
    let (iv, ciphertext) = combined.split_at(NONCE_LEN);
    open_detached(key, ciphertext, iv, b"")
}

/// Encrypt with a fresh random IV and optional associated data, keeping the
/// IV apart from the ciphertext.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn seal_detached(
    key: &EncryptionKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<DetachedCiphertext, CryptoError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = key
        .cipher()
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;
    let mut iv = [0u8; NONCE_LEN];
    iv.copy_from_slice(&nonce);
    Ok(DetachedCiphertext { ciphertext, iv })
}

/// Decrypt a ciphertext produced by [`seal_detached`].
///
/// # Errors
///
/// Returns [`CryptoError::InvalidNonce`] if `iv` is not 12 bytes and
/// [`CryptoError::Decryption`] if authentication fails (wrong key, wrong
/// associated data, or tampering).
pub fn open_detached(
    key: &EncryptionKey,
    ciphertext: &[u8],
    iv: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonce { actual: iv.len() });
    }
    key.cipher()
        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

/// Derive a subkey from `root_key` with HKDF-SHA256.
///
/// `info` must be unique per use (for example `clinvault-kms-<key id>`).
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_key(
    root_key: &EncryptionKey,
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, root_key.as_bytes());
    let mut derived = [0u8; KEY_LEN];
    hk.expand(info, &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            context: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(derived))
}

/// Derive a key-encryption key from a password with Argon2id.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if the parameters are rejected or
/// hashing fails.
pub fn derive_password_key(
    password: &str,
    salt: &[u8],
    params: KdfParams,
) -> Result<EncryptionKey, CryptoError> {
    let kdf_err = |reason: String| CryptoError::KeyDerivation {
        context: "argon2id".to_owned(),
        reason,
    };
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| kdf_err(e.to_string()))?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(password.as_bytes(), salt, &mut *key)
        .map_err(|e| kdf_err(e.to_string()))?;
    Ok(EncryptionKey::from_bytes(*key))
}

/// Fill a fresh buffer of `len` bytes from the OS CSPRNG.
#[must_use]
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn combined_format_roundtrips_and_carries_nonce() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt(&key, b"master key bytes").unwrap();
        assert_eq!(ciphertext.len(), NONCE_LEN + 16 + 16);
        assert_eq!(decrypt(&key, &ciphertext).unwrap(), b"master key bytes");
    }

    #[test]
    fn decrypt_too_short_fails() {
        let key = EncryptionKey::generate();
        assert!(matches!(
            decrypt(&key, &[0u8; 10]),
            Err(CryptoError::CiphertextTooShort {
                expected: 28,
                actual: 10
            })
        ));
    }

    #[test]
    fn tampered_tag_is_rejected() {
        let key = EncryptionKey::generate();
        let mut sealed = seal_detached(&key, b"4111222233334444", b"").unwrap();
        if let Some(byte) = sealed.ciphertext.last_mut() {
            *byte ^= 0x01;
        }
        let result = open_detached(&key, &sealed.ciphertext, &sealed.iv, b"");
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn associated_data_binds_ciphertext() {
        let key = EncryptionKey::generate();
        let sealed = seal_detached(&key, b"kek", b"key-name-a").unwrap();
        assert!(open_detached(&key, &sealed.ciphertext, &sealed.iv, b"key-name-b").is_err());
        assert_eq!(
            open_detached(&key, &sealed.ciphertext, &sealed.iv, b"key-name-a").unwrap(),
            b"kek"
        );
    }

    #[test]
    fn each_seal_uses_a_fresh_iv() {
        let key = EncryptionKey::generate();
        let a = seal_detached(&key, b"same", b"").unwrap();
        let b = seal_detached(&key, b"same", b"").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn short_iv_is_rejected_before_decrypting() {
        let key = EncryptionKey::generate();
        let result = open_detached(&key, &[0u8; 32], &[0u8; 8], b"");
        assert!(matches!(result, Err(CryptoError::InvalidNonce { actual: 8 })));
    }

    #[test]
    fn hkdf_is_deterministic_and_context_separated() {
        let root = EncryptionKey::generate();
        let a = derive_key(&root, Some(b"salt"), b"clinvault-kms-a").unwrap();
        let again = derive_key(&root, Some(b"salt"), b"clinvault-kms-a").unwrap();
        let b = derive_key(&root, Some(b"salt"), b"clinvault-kms-b").unwrap();
        assert_eq!(a.as_bytes(), again.as_bytes());
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn password_key_depends_on_password_and_salt() {
        let params = KdfParams::minimal();
        let salt = [7u8; 16];
        let a = derive_password_key("correct horse", &salt, params).unwrap();
        let again = derive_password_key("correct horse", &salt, params).unwrap();
        let other_pw = derive_password_key("battery staple", &salt, params).unwrap();
        let other_salt = derive_password_key("correct horse", &[8u8; 16], params).unwrap();
        assert_eq!(a.as_bytes(), again.as_bytes());
        assert_ne!(a.as_bytes(), other_pw.as_bytes());
        assert_ne!(a.as_bytes(), other_salt.as_bytes());
    }

    #[test]
    fn from_slice_checks_length() {
        assert!(EncryptionKey::from_slice(&[1u8; 32]).is_ok());
        assert!(matches!(
            EncryptionKey::from_slice(&[1u8; 31]),
            Err(CryptoError::InvalidKeyLength { actual: 31 })
        ));
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = EncryptionKey::from_bytes([0xAB; 32]);
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("171"));
    }

    #[test]
    fn random_bytes_has_requested_length() {
        let a = random_bytes(24);
        let b = random_bytes(24);
        assert_eq!(a.len(), 24);
        assert_ne!(a, b);
    }
}
