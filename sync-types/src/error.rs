//! Error types for queuesync wire handling.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire types.
#[derive(Debug, Error)]
pub enum SyncError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Queue body was not valid base64
    #[error("invalid body encoding: {0}")]
    BodyEncoding(#[source] base64::DecodeError),

    /// Invalid message type discriminator
    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    /// Invalid cipher discriminator
    #[error("invalid cipher: {0}")]
    InvalidCipher(u8),

    /// Envelope schema version this build does not understand
    #[error("unsupported schema version: {0}")]
    UnsupportedVersion(u8),

    /// Invalid client identifier text
    #[error("invalid client id: {0}")]
    InvalidClientId(String),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::InvalidMessageType(99);
        assert_eq!(err.to_string(), "invalid message type: 99");

        let err = SyncError::UnsupportedVersion(7);
        assert_eq!(err.to_string(), "unsupported schema version: 7");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}
