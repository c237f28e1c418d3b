//! Write or delete one local record and push a snapshot.
//!
//! Takes the data dir lock, so it refuses to run while `run` is active on
//! the same data dir.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use sync_client::{
    BackpressureMonitor, ClientRegistry, Connection, EngineConfig, EnvelopeCodec, MockBroker,
    PushOutcome, QueueTransport, Record, SharedStore, SyncEngine, MAX_UPDATED_AT,
};

use super::{codec, connect_queue, mock_queue};
use crate::files::{load_secret, AgentFiles};
use crate::store::JsonFileStore;

/// A local record change.
#[derive(Debug, Clone)]
pub struct Change {
    /// Record id.
    pub id: String,
    /// New body; `None` deletes the record.
    pub body: Option<serde_json::Value>,
    /// Parent record id.
    pub parent: Option<String>,
}

/// Run the touch command.
pub async fn run(
    config: &EngineConfig,
    files: &AgentFiles,
    change: Change,
    use_mock: bool,
) -> Result<()> {
    let _lock = files.acquire_lock()?;
    let secret = load_secret(&files.secret_file).await?;
    let codec = codec(config, &secret)?;
    let registry = ClientRegistry::open(&files.registry)
        .await
        .context("Client not initialized. Run 'queuesync-agent init' first.")?;
    let registry = Arc::new(registry);
    let store = SharedStore::new(JsonFileStore::new(&files.store));

    let (record, outcome) = if use_mock {
        let broker = MockBroker::new();
        let connection = mock_queue(&broker, config, &config.queues.sync, "sync").await?;
        let engine = engine(config, connection, codec, registry, store);
        apply_change(&engine, change, now_millis()).await?
    } else {
        let connection = connect_queue(config, &config.queues.sync, "sync").await?;
        let engine = engine(config, connection, codec, registry, store);
        apply_change(&engine, change, now_millis()).await?
    };

    if record.deleted {
        println!("Deleted record {}", record.id);
    } else {
        println!("Wrote record {}", record.id);
    }
    println!("  Updated at: {}", record.updated_at);
    match outcome {
        PushOutcome::Pushed {
            revision,
            message_id,
            records,
        } => {
            println!("  Pushed revision {} ({} records)", revision, records);
            println!("  Message ID: {}", message_id);
        }
        PushOutcome::Skipped { depth } => {
            println!("  Push skipped, sync queue backlogged ({} messages)", depth);
            println!("  The next run will push the change.");
        }
    }
    Ok(())
}

fn engine<T: QueueTransport>(
    config: &EngineConfig,
    connection: Connection<T>,
    codec: EnvelopeCodec,
    registry: Arc<ClientRegistry>,
    store: SharedStore,
) -> SyncEngine<T> {
    SyncEngine::new(
        Arc::new(connection),
        codec,
        registry,
        store,
        BackpressureMonitor::new(config.throttle_policy()),
    )
}

/// Record the change locally, then push a snapshot.
///
/// The new timestamp is never older than the record it replaces, so a local
/// edit always wins over the stored version.
pub async fn apply_change<T: QueueTransport>(
    engine: &SyncEngine<T>,
    change: Change,
    now: u64,
) -> Result<(Record, PushOutcome)> {
    let client_id = engine.client_id();
    let existing = {
        let store = engine.store().lock().await;
        store
            .snapshot()
            .await?
            .into_iter()
            .find(|r| r.id == change.id)
    };
    let at = match &existing {
        Some(record) if record.updated_at >= MAX_UPDATED_AT => anyhow::bail!(
            "Record {} carries timestamp {}, which no later edit can supersede",
            record.id,
            record.updated_at
        ),
        Some(record) => now.max(record.updated_at.saturating_add(1)),
        None => now,
    };

    let record = match change.body {
        Some(body) => {
            let record = Record::new(&change.id, at, client_id, body);
            match change.parent.or_else(|| existing.and_then(|r| r.parent_id)) {
                Some(parent) => record.with_parent(parent),
                None => record,
            }
        }
        None => existing
            .unwrap_or_else(|| Record::new(&change.id, at, client_id, serde_json::Value::Null))
            .into_tombstone(at, client_id),
    };

    engine
        .record_local_change(record.clone())
        .await
        .with_context(|| format!("Failed to store record {}", record.id))?;
    let outcome = engine
        .push_snapshot()
        .await
        .context("Failed to push snapshot")?;
    Ok((record, outcome))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_client::{
        ClientId, ConnectionOptions, EnvelopeKey, MemoryStore, MockQueue, SharedSecret,
        ThrottlePolicy,
    };

    struct Harness {
        broker: MockBroker,
        store: MemoryStore,
        engine: SyncEngine<MockQueue>,
    }

    fn harness(store: MemoryStore) -> Harness {
        let broker = MockBroker::new();
        let connection = Connection::new(
            "sync",
            broker.subscribe("sync", "sync-a"),
            ConnectionOptions::default(),
        );
        let codec = EnvelopeCodec::encrypted(EnvelopeKey::derive(&SharedSecret::random()));
        let engine = SyncEngine::new(
            Arc::new(connection),
            codec,
            Arc::new(ClientRegistry::in_memory(ClientId::random())),
            SharedStore::new(store.clone()),
            BackpressureMonitor::new(ThrottlePolicy::default()),
        );
        Harness {
            broker,
            store,
            engine,
        }
    }

    fn change(id: &str, body: Option<serde_json::Value>) -> Change {
        Change {
            id: id.into(),
            body,
            parent: None,
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    #[tokio::test]
    async fn new_record_is_stored_and_pushed() {
        let h = harness(MemoryStore::new());
        let (record, outcome) = apply_change(&h.engine, change("a", Some(json!({"n": 1}))), 100)
            .await
            .unwrap();

        assert_eq!(record.updated_at, 100);
        assert_eq!(record.updated_by, h.engine.client_id());
        assert_eq!(h.store.get("a").unwrap().body, json!({"n": 1}));
        assert!(matches!(outcome, PushOutcome::Pushed { records: 1, .. }));
        assert_eq!(h.broker.published(), 1);
    }

    #[tokio::test]
    async fn edit_never_moves_timestamp_backwards() {
        let other = ClientId::random();
        let h = harness(MemoryStore::with_records([Record::new(
            "a",
            500,
            other,
            json!("old"),
        )]));

        // Local clock behind the stored record
        let (record, _) = apply_change(&h.engine, change("a", Some(json!("new"))), 100)
            .await
            .unwrap();

        assert_eq!(record.updated_at, 501);
        assert_eq!(h.store.get("a").unwrap().body, json!("new"));
    }

    #[tokio::test]
    async fn edit_keeps_existing_parent() {
        let other = ClientId::random();
        let h = harness(MemoryStore::with_records([
            Record::new("a", 1, other, json!("v")).with_parent("root")
        ]));

        let (record, _) = apply_change(&h.engine, change("a", Some(json!("w"))), 10)
            .await
            .unwrap();
        assert_eq!(record.parent_id.as_deref(), Some("root"));
    }

    #[tokio::test]
    async fn edit_of_record_at_timestamp_limit_is_refused() {
        let other = ClientId::random();
        let h = harness(MemoryStore::with_records([Record::new(
            "a",
            u64::MAX,
            other,
            json!("pinned"),
        )]));

        let result = apply_change(&h.engine, change("a", Some(json!("new"))), 100).await;

        assert!(result.is_err());
        assert_eq!(h.store.get("a").unwrap().body, json!("pinned"));
        assert_eq!(h.broker.published(), 0);
    }

    #[tokio::test]
    async fn edit_just_below_limit_still_wins() {
        let other = ClientId::random();
        let h = harness(MemoryStore::with_records([Record::new(
            "a",
            MAX_UPDATED_AT - 1,
            other,
            json!("old"),
        )]));

        let (record, _) = apply_change(&h.engine, change("a", Some(json!("new"))), 100)
            .await
            .unwrap();
        assert_eq!(record.updated_at, MAX_UPDATED_AT);
    }

    // ========================================================================
    // Data dir ownership
    // ========================================================================

    #[tokio::test]
    async fn touch_refuses_while_data_dir_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let files = AgentFiles::in_dir(dir.path().to_path_buf(), None);
        crate::commands::init::run(&files, None).await.unwrap();

        // A running agent holds the data dir
        let _running = files.acquire_lock().unwrap();
        let err = run(
            &EngineConfig::default(),
            &files,
            change("a", Some(json!(1))),
            true,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("in use"));
        assert!(!files.store.exists());
    }

    // ========================================================================
    // Deletes
    // ========================================================================

    #[tokio::test]
    async fn delete_writes_tombstone() {
        let other = ClientId::random();
        let h = harness(MemoryStore::with_records([Record::new(
            "a",
            5,
            other,
            json!("v"),
        )]));

        let (record, _) = apply_change(&h.engine, change("a", None), 50).await.unwrap();

        assert!(record.deleted);
        let stored = h.store.get("a").unwrap();
        assert!(stored.deleted);
        assert_eq!(stored.updated_at, 50);
        assert_eq!(stored.updated_by, h.engine.client_id());
    }

    #[tokio::test]
    async fn deleting_unknown_record_still_leaves_tombstone() {
        let h = harness(MemoryStore::new());
        apply_change(&h.engine, change("ghost", None), 7).await.unwrap();

        assert!(h.store.get("ghost").unwrap().deleted);
    }
}
