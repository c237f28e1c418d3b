//! Envelope codec: seal plaintext payloads into envelopes and open them again.
//!
//! The codec owns the "encryption required" policy. When it is on (the
//! default) a message that is not encrypted, fails authentication, or does
//! not parse as an envelope is rejected outright. There is no fallback that
//! would let such a message through.

use sync_types::{Cipher, ClientId, Envelope, MessageId, MessageType, SyncError};
use thiserror::Error;

use crate::crypto::{CryptoError, EnvelopeKey};

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Authentication tag did not verify. Security relevant.
    #[error("authentication failed")]
    Authentication,

    /// Encryption failed.
    #[error(transparent)]
    Crypto(CryptoError),

    /// Body is not a well-formed envelope (or has an unknown version/type).
    #[error("malformed envelope: {0}")]
    Malformed(#[from] SyncError),

    /// Unencrypted envelope received while encryption is required.
    #[error("plaintext envelope rejected: encryption is required")]
    PlaintextRejected,

    /// Encrypted envelope received but no key is configured.
    #[error("encrypted envelope received but no key is configured")]
    NoKey,

    /// Encryption required but no key was supplied.
    #[error("encryption is required but no key was supplied")]
    MissingKey,
}

impl From<CryptoError> for CodecError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed => CodecError::Authentication,
            other => CodecError::Crypto(other),
        }
    }
}

impl CodecError {
    /// Whether this rejection should be logged as a security event.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, CodecError::Authentication | CodecError::PlaintextRejected)
    }
}

/// An authenticated, decrypted envelope.
#[derive(Clone, PartialEq, Eq)]
pub struct Opened {
    /// Payload kind.
    pub message_type: MessageType,
    /// Sending client (authenticated as part of the header).
    pub sender_id: ClientId,
    /// Unique id for de-duplication.
    pub message_id: MessageId,
    /// Decrypted MessagePack payload.
    pub plaintext: Vec<u8>,
}

impl std::fmt::Debug for Opened {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opened")
            .field("message_type", &self.message_type)
            .field("sender_id", &self.sender_id)
            .field("message_id", &self.message_id)
            .field("plaintext", &format!("[{} bytes]", self.plaintext.len()))
            .finish()
    }
}

/// Seals and opens envelopes under one key and policy.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    key: Option<EnvelopeKey>,
    encryption_required: bool,
}

impl EnvelopeCodec {
    /// Create a codec.
    ///
    /// Fails with [`CodecError::MissingKey`] if encryption is required and
    /// no key is given.
    pub fn new(key: Option<EnvelopeKey>, encryption_required: bool) -> Result<Self, CodecError> {
        if encryption_required && key.is_none() {
            return Err(CodecError::MissingKey);
        }
        Ok(Self {
            key,
            encryption_required,
        })
    }

    /// Codec that encrypts everything and accepts only authenticated envelopes.
    pub fn encrypted(key: EnvelopeKey) -> Self {
        Self {
            key: Some(key),
            encryption_required: true,
        }
    }

    /// Whether plaintext envelopes are rejected.
    pub fn encryption_required(&self) -> bool {
        self.encryption_required
    }

    /// Build an envelope carrying `plaintext`.
    ///
    /// Encrypts whenever a key is configured, binding the header as
    /// associated data.
    pub fn seal(
        &self,
        message_type: MessageType,
        sender_id: ClientId,
        plaintext: &[u8],
    ) -> Result<Envelope, CodecError> {
        match &self.key {
            Some(key) => {
                let mut envelope =
                    Envelope::new(message_type, sender_id, Cipher::XChaCha20Poly1305);
                let (ciphertext, nonce, tag) =
                    key.encrypt(plaintext, &envelope.associated_data())?;
                envelope.ciphertext = ciphertext;
                envelope.nonce = nonce;
                envelope.tag = tag;
                Ok(envelope)
            }
            None => {
                let mut envelope = Envelope::new(message_type, sender_id, Cipher::None);
                envelope.ciphertext = plaintext.to_vec();
                Ok(envelope)
            }
        }
    }

    /// Seal and encode as a text queue body.
    pub fn seal_body(
        &self,
        message_type: MessageType,
        sender_id: ClientId,
        plaintext: &[u8],
    ) -> Result<(MessageId, String), CodecError> {
        let envelope = self.seal(message_type, sender_id, plaintext)?;
        Ok((envelope.message_id, envelope.to_body()?))
    }

    /// Authenticate and decrypt an envelope, enforcing the policy.
    pub fn open(&self, envelope: &Envelope) -> Result<Opened, CodecError> {
        let message_type = envelope.message_type()?;
        let plaintext = match envelope.cipher()? {
            Cipher::XChaCha20Poly1305 => {
                let key = self.key.as_ref().ok_or(CodecError::NoKey)?;
                key.decrypt(
                    &envelope.ciphertext,
                    &envelope.nonce,
                    &envelope.tag,
                    &envelope.associated_data(),
                )?
            }
            Cipher::None if self.encryption_required => {
                return Err(CodecError::PlaintextRejected);
            }
            Cipher::None => envelope.ciphertext.clone(),
        };

        Ok(Opened {
            message_type,
            sender_id: envelope.sender_id,
            message_id: envelope.message_id,
            plaintext,
        })
    }

    /// Decode a text queue body and open it.
    pub fn open_body(&self, body: &str) -> Result<Opened, CodecError> {
        let envelope = Envelope::from_body(body)?;
        self.open(&envelope)
    }
}
