//! Cryptographic primitives for queuesync.
//!
//! This module provides:
//! - [`SharedSecret`], the 32-byte root secret provisioned to every client
//! - [`EnvelopeKey`], the encryption subkey derived from it via HKDF-SHA256
//! - XChaCha20-Poly1305 encryption with 192-bit nonces and detached tags
//!
//! # Security Notes
//!
//! - XChaCha20 uses 192-bit nonces (24 bytes), safe for random generation
//! - Every call draws a fresh nonce; nonces are never derived from counters
//! - Key material is zeroized on drop and redacted in `Debug` output

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    Tag, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use sync_types::{NONCE_SIZE, TAG_SIZE};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// HKDF salt, domain-separating queuesync keys from any other use of the secret.
const HKDF_SALT: &[u8] = b"queuesync-envelope-key-v1";

/// HKDF info for the payload encryption subkey.
const HKDF_INFO_ENCRYPTION: &[u8] = b"encryption";

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Secret text is not valid hex.
    #[error("invalid secret encoding: {0}")]
    InvalidEncoding(String),
}

/// The root secret shared by every client of one deployment.
///
/// Provisioning is external: operators distribute it out of band (the agent
/// stores it hex-encoded in an owner-only file).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_SIZE]);

impl SharedSecret {
    /// Create a random SharedSecret.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Copy secret bytes from a slice of exactly [`KEY_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    /// Parse a hex-encoded secret. Surrounding whitespace is ignored.
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let mut bytes =
            hex::decode(text.trim()).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let secret = Self::from_slice(&bytes);
        bytes.zeroize();
        secret
    }

    /// Hex-encode the secret for storage.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

// Don't leak secret in debug output
impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// Payload encryption key, derived from a [`SharedSecret`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EnvelopeKey {
    encryption_key: [u8; KEY_SIZE],
}

impl EnvelopeKey {
    /// Derive an EnvelopeKey from a SharedSecret using HKDF-SHA256.
    pub fn derive(secret: &SharedSecret) -> Self {
        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret.as_bytes());

        let mut encryption_key = [0u8; KEY_SIZE];
        hkdf.expand(HKDF_INFO_ENCRYPTION, &mut encryption_key)
            .expect("32 bytes is a valid HKDF-SHA256 output length");

        Self { encryption_key }
    }

    /// Encrypt `plaintext`, authenticating `associated_data` alongside it.
    ///
    /// Returns `(ciphertext, nonce, tag)`. The nonce is 192 bits, drawn
    /// fresh from the OS for every call.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(Vec<u8>, [u8; NONCE_SIZE], [u8; TAG_SIZE]), CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).expect("getrandom failed");
        let nonce = XNonce::from_slice(&nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.encryption_key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(nonce, associated_data, &mut buffer)
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(&tag);

        Ok((buffer, nonce_bytes, tag_bytes))
    }

    /// Decrypt and authenticate.
    ///
    /// Any change to the ciphertext, nonce, tag or associated data yields
    /// [`CryptoError::DecryptionFailed`]; no partial plaintext is returned.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
        tag: &[u8; TAG_SIZE],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = XNonce::from_slice(nonce);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.encryption_key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut buffer = ciphertext.to_vec();
        match cipher.decrypt_in_place_detached(
            nonce,
            associated_data,
            &mut buffer,
            Tag::from_slice(tag),
        ) {
            Ok(()) => Ok(buffer),
            Err(_) => {
                buffer.zeroize();
                Err(CryptoError::DecryptionFailed)
            }
        }
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnvelopeKey {{ encryption_key: [REDACTED] }}")
    }
}
