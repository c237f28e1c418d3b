//! Plaintext payloads carried inside an [`Envelope`](crate::Envelope).
//!
//! These are MessagePack-encoded before encryption. Which one a decrypted
//! payload holds is determined by the envelope's message type.

use serde::{Deserialize, Serialize};

use crate::{ClientId, Revision, SyncError};

/// A one-shot command for the external executor.
///
/// The engine routes commands by envelope type only; `kind` and `args` are
/// opaque to it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Command kind tag, e.g. `"print"`
    pub kind: String,
    /// Executor-defined arguments
    pub args: Vec<u8>,
}

impl Command {
    /// Create a command.
    pub fn new(kind: impl Into<String>, args: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("args", &format!("[{} bytes]", self.args.len()))
            .finish()
    }
}

/// Latest `updated_at` a record may carry.
///
/// Leaves headroom above every real millisecond clock so a local edit can
/// always be stamped later than the version it replaces.
pub const MAX_UPDATED_AT: u64 = i64::MAX as u64;

/// One record of the hierarchical record store.
///
/// `updated_at` is unix milliseconds of the last write and `updated_by` the
/// client that made it; together they order competing versions. A record
/// with `deleted == true` is a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable record identifier
    pub id: String,
    /// Parent record, if any (validated by the store, not the engine)
    pub parent_id: Option<String>,
    /// Last write time, unix milliseconds
    pub updated_at: u64,
    /// Client that performed the last write
    pub updated_by: ClientId,
    /// Tombstone marker
    pub deleted: bool,
    /// Store-defined record content
    pub body: serde_json::Value,
}

impl Record {
    /// Create a live record.
    pub fn new(
        id: impl Into<String>,
        updated_at: u64,
        updated_by: ClientId,
        body: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            updated_at,
            updated_by,
            deleted: false,
            body,
        }
    }

    /// Set the parent record.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Turn this record into a tombstone written at `at` by `by`.
    pub fn into_tombstone(mut self, at: u64, by: ClientId) -> Self {
        self.deleted = true;
        self.updated_at = at;
        self.updated_by = by;
        self.body = serde_json::Value::Null;
        self
    }
}

/// A full copy of one client's record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Sender's revision counter at push time
    pub revision: Revision,
    /// Sender client id (must match the envelope sender)
    pub originating_client_id: ClientId,
    /// Every record in the sender's store, tombstones included
    pub records: Vec<Record>,
}

impl Snapshot {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_roundtrip_preserves_records() {
        let client = ClientId::random();
        let snapshot = Snapshot {
            revision: Revision::new(4),
            originating_client_id: client,
            records: vec![
                Record::new("root", 10, client, json!({"title": "Inbox"})),
                Record::new("child", 11, client, json!({"n": [1, 2, 3]})).with_parent("root"),
                Record::new("gone", 12, client, json!(null)).into_tombstone(13, client),
            ],
        };

        let bytes = snapshot.to_bytes().unwrap();
        let restored = Snapshot::from_bytes(&bytes).unwrap();
        assert_eq!(snapshot, restored);
        assert_eq!(restored.records[1].parent_id.as_deref(), Some("root"));
        assert!(restored.records[2].deleted);
    }

    #[test]
    fn command_is_not_a_snapshot() {
        let bytes = Command::new("print", b"label-42".to_vec()).to_bytes().unwrap();
        assert!(Snapshot::from_bytes(&bytes).is_err());
    }

    #[test]
    fn tombstone_clears_body() {
        let client = ClientId::random();
        let record = Record::new("a", 1, client, json!({"x": 1})).into_tombstone(5, client);
        assert!(record.deleted);
        assert_eq!(record.updated_at, 5);
        assert_eq!(record.body, serde_json::Value::Null);
    }

    #[test]
    fn command_debug_hides_args() {
        let debug = format!("{:?}", Command::new("print", vec![0xDE, 0xAD]));
        assert!(debug.contains("[2 bytes]"));
        assert!(!debug.contains("222"));
    }
}
