//! Envelope - the wire format wrapper for everything put on the queue.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::{ClientId, MessageId, SyncError};

/// Envelope schema version produced and accepted by this build.
pub const SCHEMA_VERSION: u8 = 1;

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Message type discriminator for envelope routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// One-shot command for the external executor
    Command = 1,
    /// Full-state snapshot of the sender's record store
    StateSnapshot = 2,
}

impl TryFrom<u8> for MessageType {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Command),
            2 => Ok(MessageType::StateSnapshot),
            _ => Err(SyncError::InvalidMessageType(value)),
        }
    }
}

/// How the envelope payload is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Cipher {
    /// Plaintext payload. Only accepted when encryption is not required.
    None = 0,
    /// XChaCha20-Poly1305 with a detached tag
    XChaCha20Poly1305 = 1,
}

impl TryFrom<u8> for Cipher {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Cipher::None),
            1 => Ok(Cipher::XChaCha20Poly1305),
            _ => Err(SyncError::InvalidCipher(value)),
        }
    }
}

/// The envelope wraps every queued message with routing metadata.
///
/// This is the layer the queue service sees. The payload is encrypted and
/// the header fields are bound into the authentication tag as associated
/// data (see [`Envelope::associated_data`]).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Schema version (currently 1)
    pub schema_version: u8,
    /// Message type discriminator
    pub message_type: u8,
    /// Sending client
    pub sender_id: ClientId,
    /// Unique id for de-duplication
    pub message_id: MessageId,
    /// Cipher discriminator
    pub cipher: u8,
    /// Encryption nonce (24 bytes for XChaCha20)
    pub nonce: [u8; NONCE_SIZE],
    /// Encrypted payload (MessagePack-encoded inner message)
    pub ciphertext: Vec<u8>,
    /// Detached Poly1305 tag
    pub tag: [u8; TAG_SIZE],
}

impl Envelope {
    /// Create a new envelope header with a fresh message id and empty body.
    ///
    /// The codec fills in `nonce`, `ciphertext` and `tag` after binding the
    /// header as associated data.
    pub fn new(message_type: MessageType, sender_id: ClientId, cipher: Cipher) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            message_type: message_type as u8,
            sender_id,
            message_id: MessageId::new(),
            cipher: cipher as u8,
            nonce: [0u8; NONCE_SIZE],
            ciphertext: Vec::new(),
            tag: [0u8; TAG_SIZE],
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    ///
    /// Unknown schema versions, message types and ciphers are rejected here,
    /// before any cryptographic work is attempted.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let envelope: Self = rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)?;
        if envelope.schema_version != SCHEMA_VERSION {
            return Err(SyncError::UnsupportedVersion(envelope.schema_version));
        }
        envelope.message_type()?;
        envelope.cipher()?;
        Ok(envelope)
    }

    /// Encode as a text queue body (base64 of the MessagePack bytes).
    pub fn to_body(&self) -> Result<String, SyncError> {
        Ok(URL_SAFE_NO_PAD.encode(self.to_bytes()?))
    }

    /// Decode a text queue body.
    pub fn from_body(body: &str) -> Result<Self, SyncError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(body.trim())
            .map_err(SyncError::BodyEncoding)?;
        Self::from_bytes(&bytes)
    }

    /// Get the message type as an enum.
    pub fn message_type(&self) -> Result<MessageType, SyncError> {
        MessageType::try_from(self.message_type)
    }

    /// Get the cipher as an enum.
    pub fn cipher(&self) -> Result<Cipher, SyncError> {
        Cipher::try_from(self.cipher)
    }

    /// Header bytes authenticated alongside the payload.
    ///
    /// Layout: version | message_type | cipher | sender_id (32) | message_id (16).
    pub fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(3 + 32 + 16);
        aad.push(self.schema_version);
        aad.push(self.message_type);
        aad.push(self.cipher);
        aad.extend_from_slice(self.sender_id.as_bytes());
        aad.extend_from_slice(self.message_id.as_bytes());
        aad
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("schema_version", &self.schema_version)
            .field("message_type", &self.message_type)
            .field("sender_id", &self.sender_id)
            .field("message_id", &self.message_id)
            .field("cipher", &self.cipher)
            .field(
                "ciphertext",
                &format!("[{} bytes REDACTED]", self.ciphertext.len()),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        let mut envelope = Envelope::new(
            MessageType::StateSnapshot,
            ClientId::random(),
            Cipher::XChaCha20Poly1305,
        );
        envelope.nonce = [7u8; NONCE_SIZE];
        envelope.ciphertext = vec![1, 2, 3, 4];
        envelope.tag = [9u8; TAG_SIZE];
        envelope
    }

    #[test]
    fn envelope_serialize_roundtrip() {
        let envelope = sample();
        let bytes = envelope.to_bytes().unwrap();
        let restored = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(envelope, restored);
    }

    #[test]
    fn envelope_body_is_text_safe() {
        let body = sample().to_body().unwrap();
        assert!(body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(Envelope::from_body(&body).is_ok());
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let mut envelope = sample();
        envelope.schema_version = 2;
        let bytes = envelope.to_bytes().unwrap();
        assert!(matches!(
            Envelope::from_bytes(&bytes),
            Err(SyncError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut envelope = sample();
        envelope.message_type = 42;
        let bytes = envelope.to_bytes().unwrap();
        assert!(matches!(
            Envelope::from_bytes(&bytes),
            Err(SyncError::InvalidMessageType(42))
        ));
    }

    #[test]
    fn garbage_body_is_rejected() {
        assert!(matches!(
            Envelope::from_body("not base64 !!"),
            Err(SyncError::BodyEncoding(_))
        ));
        let body = URL_SAFE_NO_PAD.encode(b"plain text, not msgpack");
        assert!(Envelope::from_body(&body).is_err());
    }

    #[test]
    fn message_type_roundtrip() {
        for val in 1..=2u8 {
            let mt = MessageType::try_from(val).unwrap();
            assert_eq!(mt as u8, val);
        }
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(3).is_err());
    }

    #[test]
    fn associated_data_covers_header() {
        let envelope = sample();
        let aad = envelope.associated_data();
        assert_eq!(aad.len(), 51);
        assert_eq!(aad[0], SCHEMA_VERSION);
        assert_eq!(aad[1], MessageType::StateSnapshot as u8);
        assert_eq!(&aad[3..35], envelope.sender_id.as_bytes());
    }

    #[test]
    fn new_envelopes_get_distinct_message_ids() {
        let sender = ClientId::random();
        let a = Envelope::new(MessageType::Command, sender, Cipher::XChaCha20Poly1305);
        let b = Envelope::new(MessageType::Command, sender, Cipher::XChaCha20Poly1305);
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn debug_redacts_ciphertext() {
        let debug = format!("{:?}", sample());
        assert!(debug.contains("[4 bytes REDACTED]"));
    }
}
