//! Record store backed by one JSON file.
//!
//! `apply` writes the whole record set to a temporary file and renames it
//! into place, so the store on disk is always either the old or the new set.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use sync_client::{write_private_atomic, Record, RecordStore, StoreError};

/// JSON file record store.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store at `path`. A missing file is an empty store.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File backing the store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn snapshot(&self) -> Result<Vec<Record>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_str(&contents).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn apply(&self, mut records: Vec<Record>) -> Result<(), StoreError> {
        let self_parented = records
            .iter()
            .find(|r| r.parent_id.as_deref() == Some(r.id.as_str()));
        if let Some(record) = self_parented {
            return Err(StoreError::Rejected(format!(
                "record {} is its own parent",
                record.id
            )));
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        let contents =
            serde_json::to_vec_pretty(&records).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        write_private_atomic(&self.path, &contents)
            .await
            .map_err(|e| self.io_error(e))
    }
}
