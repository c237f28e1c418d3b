//! Record store collaborator.
//!
//! The engine does not own application state. It needs two things from the
//! store: a full snapshot of the current records, and an atomic replace with
//! a merged record set. Validation rules (parent depth, ordering) are the
//! store's business.
//!
//! All access that mutates records goes through one gate, [`SharedStore`],
//! so a snapshot push never observes a half-applied merge.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sync_types::Record;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("store I/O error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Stored data cannot be parsed.
    #[error("store data is corrupt: {0}")]
    Corrupt(String),

    /// The store refused the record set.
    #[error("store rejected records: {0}")]
    Rejected(String),
}

/// Access to local application state.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every record, tombstones included.
    async fn snapshot(&self) -> Result<Vec<Record>, StoreError>;

    /// Atomically replace the record set. Either all records are stored or
    /// none are.
    async fn apply(&self, records: Vec<Record>) -> Result<(), StoreError>;

    /// Insert or replace one record (a local mutation).
    async fn upsert(&self, record: Record) -> Result<(), StoreError> {
        let mut records = self.snapshot().await?;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        self.apply(records).await
    }
}

/// A record store behind the mutation gate.
///
/// Cloning shares the store and the gate.
#[derive(Clone)]
pub struct SharedStore {
    store: Arc<dyn RecordStore>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl SharedStore {
    /// Put `store` behind a fresh gate.
    pub fn new(store: impl RecordStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Wait for the gate and get exclusive access.
    pub async fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            _gate: self.gate.lock().await,
            store: self.store.as_ref(),
        }
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore").finish_non_exhaustive()
    }
}

/// Exclusive access to the store while held.
pub struct StoreGuard<'a> {
    _gate: tokio::sync::MutexGuard<'a, ()>,
    store: &'a (dyn RecordStore + 'static),
}

impl Deref for StoreGuard<'_> {
    type Target = dyn RecordStore;

    fn deref(&self) -> &Self::Target {
        self.store
    }
}

/// In-memory record store for tests and `--mock` runs.
///
/// Cloning shares state, so a test can keep a handle while the engine owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: BTreeMap<String, Record>,
    applies: usize,
    fail_next_apply: Option<String>,
    reject_next_apply: Option<String>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-filled with `records`.
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let store = Self::new();
        store.lock().records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current records ordered by id.
    pub fn records(&self) -> Vec<Record> {
        self.lock().records.values().cloned().collect()
    }

    /// One record by id.
    pub fn get(&self, id: &str) -> Option<Record> {
        self.lock().records.get(id).cloned()
    }

    /// Number of successful `apply` calls.
    pub fn apply_count(&self) -> usize {
        self.lock().applies
    }

    /// Cause the next `apply()` to fail with an I/O error.
    pub fn fail_next_apply(&self, error: &str) {
        self.lock().fail_next_apply = Some(error.to_string());
    }

    /// Cause the next `apply()` to refuse the record set.
    pub fn reject_next_apply(&self, reason: &str) {
        self.lock().reject_next_apply = Some(reason.to_string());
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn snapshot(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.records())
    }

    async fn apply(&self, records: Vec<Record>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_apply.take() {
            return Err(StoreError::Io {
                path: PathBuf::from("<memory>"),
                source: std::io::Error::other(error),
            });
        }
        if let Some(reason) = inner.reject_next_apply.take() {
            return Err(StoreError::Rejected(reason));
        }
        inner.records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        inner.applies += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_types::ClientId;

    fn record(id: &str, at: u64) -> Record {
        Record::new(id, at, ClientId::from_bytes(&[1u8; 32]).unwrap(), json!({"n": at}))
    }

    #[tokio::test]
    async fn apply_replaces_everything() {
        let store = MemoryStore::with_records([record("a", 1), record("b", 1)]);
        store.apply(vec![record("c", 2)]).await.unwrap();

        let ids: Vec<String> = store.records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c"]);
        assert_eq!(store.apply_count(), 1);
    }

    #[tokio::test]
    async fn failed_apply_leaves_state_untouched() {
        let store = MemoryStore::with_records([record("a", 1)]);
        store.fail_next_apply("disk full");

        assert!(matches!(
            store.apply(vec![]).await,
            Err(StoreError::Io { .. })
        ));
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.apply_count(), 0);

        store.reject_next_apply("bad parent");
        assert!(matches!(
            store.apply(vec![]).await,
            Err(StoreError::Rejected(_))
        ));
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn upsert_inserts_and_replaces() {
        let store = MemoryStore::new();
        store.upsert(record("a", 1)).await.unwrap();
        store.upsert(record("a", 5)).await.unwrap();
        store.upsert(record("b", 2)).await.unwrap();

        assert_eq!(store.records().len(), 2);
        assert_eq!(store.get("a").unwrap().updated_at, 5);
    }

    #[tokio::test]
    async fn shared_store_serializes_access() {
        let memory = MemoryStore::new();
        let shared = SharedStore::new(memory.clone());

        let guard = shared.lock().await;
        let other = shared.clone();
        let waiter = tokio::spawn(async move {
            let store = other.lock().await;
            store.upsert(record("late", 9)).await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(memory.get("late").is_none(), "gate must block the second writer");
        guard.upsert(record("first", 1)).await.unwrap();
        drop(guard);

        waiter.await.unwrap();
        assert!(memory.get("late").is_some());
        assert!(memory.get("first").is_some());
    }
}
