//! State synchronization engine.
//!
//! Pushes full snapshots of the local record store and merges snapshots
//! pushed by peers. Convergence rests on two properties:
//!
//! 1. Last-writer-wins merge is order independent and idempotent, so every
//!    client that has seen the same snapshots holds the same records.
//! 2. Per-peer revisions only move forward, so a snapshot overtaken by a
//!    newer one from the same peer is dropped instead of merged.
//!
//! Snapshot reads and merge-applies both run under the store's mutation gate.

use std::sync::Arc;
use std::time::Duration;

use sync_core::{merge, MergeStats, SnapshotDecision};
use sync_types::{
    ClientId, MessageId, MessageType, Record, Revision, Snapshot, SyncError, MAX_UPDATED_AT,
};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backpressure::{Admission, BackpressureMonitor};
use crate::codec::{CodecError, EnvelopeCodec, Opened};
use crate::connection::Connection;
use crate::registry::{ClientRegistry, RegistryError};
use crate::store::{SharedStore, StoreError};
use crate::transport::{QueueTransport, TransportError};

/// Default periodic push interval.
pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Errors from the sync engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Snapshot could not be serialized.
    #[error("cannot encode snapshot: {0}")]
    Encode(#[from] SyncError),

    /// Snapshot could not be sealed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Push failed after retries.
    #[error("snapshot push failed: {0}")]
    Transport(#[from] TransportError),

    /// Store read or apply failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Revision bookkeeping failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What a push attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Snapshot accepted by the queue.
    Pushed {
        /// Revision carried by the snapshot.
        revision: Revision,
        /// Envelope id.
        message_id: MessageId,
        /// Number of records in the snapshot.
        records: usize,
    },
    /// Backlog stayed over the threshold; try again on the next trigger.
    Skipped {
        /// Last observed depth.
        depth: u64,
    },
}

/// What the engine did with an incoming snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Merged and applied to the store.
    Applied(MergeStats),
    /// Merged, but nothing changed; the store was not touched.
    Unchanged(MergeStats),
    /// Our own snapshot; discarded.
    SelfEcho,
    /// Older than what we already applied from this peer; discarded.
    Stale {
        /// Highest revision recorded for the peer.
        seen: Revision,
    },
    /// Payload unusable; discarded.
    Malformed(String),
}

/// Snapshot push and merge.
pub struct SyncEngine<T> {
    connection: Arc<Connection<T>>,
    codec: EnvelopeCodec,
    registry: Arc<ClientRegistry>,
    store: SharedStore,
    backpressure: BackpressureMonitor,
    trigger: Arc<Notify>,
}

impl<T: QueueTransport> SyncEngine<T> {
    /// Create an engine pushing through `connection`.
    pub fn new(
        connection: Arc<Connection<T>>,
        codec: EnvelopeCodec,
        registry: Arc<ClientRegistry>,
        store: SharedStore,
        backpressure: BackpressureMonitor,
    ) -> Self {
        Self {
            connection,
            codec,
            registry,
            store,
            backpressure,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// This client's id.
    pub fn client_id(&self) -> ClientId {
        self.registry.client_id()
    }

    /// The registry holding revision bookkeeping.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// The gated store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// The connection snapshots are pushed through.
    pub fn connection(&self) -> &Arc<Connection<T>> {
        &self.connection
    }

    /// Ask the push loop to push soon.
    pub fn trigger_push(&self) {
        self.trigger.notify_one();
    }

    /// Apply a local mutation under the gate and trigger a push.
    pub async fn record_local_change(&self, record: Record) -> Result<(), EngineError> {
        {
            let store = self.store.lock().await;
            store.upsert(record).await?;
        }
        self.trigger_push();
        Ok(())
    }

    /// Push one snapshot of the local store.
    pub async fn push_snapshot(&self) -> Result<PushOutcome, EngineError> {
        if let Admission::Saturated { depth } =
            self.backpressure.wait_for_capacity(&self.connection).await
        {
            info!(depth, "sync queue backlogged, skipping snapshot push");
            return Ok(PushOutcome::Skipped { depth });
        }

        let snapshot = {
            let store = self.store.lock().await;
            let records = store.snapshot().await?;
            let revision = self.registry.next_revision().await?;
            Snapshot {
                revision,
                originating_client_id: self.client_id(),
                records,
            }
        };

        let plaintext = snapshot.to_bytes()?;
        let (message_id, body) =
            self.codec
                .seal_body(MessageType::StateSnapshot, self.client_id(), &plaintext)?;
        self.connection.push(&body).await?;

        info!(
            revision = %snapshot.revision,
            %message_id,
            records = snapshot.records.len(),
            "snapshot pushed"
        );
        Ok(PushOutcome::Pushed {
            revision: snapshot.revision,
            message_id,
            records: snapshot.records.len(),
        })
    }

    /// Merge a decrypted `STATE_SNAPSHOT` envelope.
    ///
    /// `Ok` means the message may be acknowledged. An `Err` means the merge
    /// did not complete and the message must be left for redelivery.
    pub async fn on_snapshot(&self, opened: &Opened) -> Result<SnapshotOutcome, EngineError> {
        let snapshot = match Snapshot::from_bytes(&opened.plaintext) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    message_id = %opened.message_id,
                    sender = %opened.sender_id,
                    error = %e,
                    "undecodable snapshot payload, discarding"
                );
                return Ok(SnapshotOutcome::Malformed(e.to_string()));
            }
        };

        if snapshot.originating_client_id != opened.sender_id {
            warn!(
                message_id = %opened.message_id,
                sender = %opened.sender_id,
                originating = %snapshot.originating_client_id,
                "snapshot origin does not match envelope sender, discarding"
            );
            return Ok(SnapshotOutcome::Malformed(
                "originating client id does not match sender".into(),
            ));
        }

        if let Some(record) = snapshot
            .records
            .iter()
            .find(|r| r.updated_at > MAX_UPDATED_AT)
        {
            warn!(
                message_id = %opened.message_id,
                sender = %opened.sender_id,
                record = %record.id,
                updated_at = record.updated_at,
                "snapshot carries a timestamp out of range, discarding"
            );
            return Ok(SnapshotOutcome::Malformed(format!(
                "record {} has updated_at out of range",
                record.id
            )));
        }

        let sender = opened.sender_id;
        let revision = snapshot.revision;
        let store = self.store.lock().await;

        match self.registry.classify(&sender, revision).await {
            SnapshotDecision::SelfEcho => {
                debug!(%revision, "own snapshot echoed back, discarding");
                return Ok(SnapshotOutcome::SelfEcho);
            }
            SnapshotDecision::Stale { seen } => {
                debug!(%sender, %revision, %seen, "stale snapshot, discarding");
                return Ok(SnapshotOutcome::Stale { seen });
            }
            SnapshotDecision::Apply => {}
        }

        let local = store.snapshot().await?;
        let merged = merge(&local, &snapshot.records);
        let stats = merged.stats;
        let changed = merged.changed();
        if changed {
            match store.apply(merged.records).await {
                Ok(()) => {}
                Err(StoreError::Rejected(reason)) => {
                    // Redelivery would be refused the same way.
                    warn!(
                        message_id = %opened.message_id,
                        %sender,
                        %revision,
                        %reason,
                        "store refused merged snapshot, discarding"
                    );
                    return Ok(SnapshotOutcome::Malformed(reason));
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.registry.record_peer_revision(sender, revision).await?;
        drop(store);

        debug!(
            %sender,
            %revision,
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            tombstoned = stats.tombstoned,
            "snapshot merged"
        );
        Ok(if changed {
            SnapshotOutcome::Applied(stats)
        } else {
            SnapshotOutcome::Unchanged(stats)
        })
    }

    /// Push on every trigger and every `interval` until shutdown.
    ///
    /// Failed pushes are logged; the next trigger or tick tries again.
    pub async fn run_push_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately: push once on startup.

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {}
                _ = shutdown.changed() => break,
            }

            if let Err(error) = self.push_snapshot().await {
                warn!(%error, "snapshot push failed, waiting for next trigger");
            }
        }
        debug!("push loop stopped");
    }
}

impl<T> std::fmt::Debug for SyncEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("client_id", &self.registry.client_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::crypto::{EnvelopeKey, SharedSecret};
    use crate::store::MemoryStore;
    use crate::transport::{MockBroker, MockOp, MockQueue};
    use serde_json::json;
    use sync_core::{RetryPolicy, ThrottlePolicy};

    struct Setup {
        broker: MockBroker,
        codec: EnvelopeCodec,
        memory: MemoryStore,
        engine: SyncEngine<MockQueue>,
    }

    fn setup(records: Vec<Record>) -> Setup {
        let broker = MockBroker::new();
        let codec = EnvelopeCodec::encrypted(EnvelopeKey::derive(&SharedSecret::random()));
        let memory = MemoryStore::with_records(records);
        let options = ConnectionOptions {
            retry: RetryPolicy::no_retry(),
            ..ConnectionOptions::default()
        };
        let engine = SyncEngine::new(
            Arc::new(Connection::new(
                "sync",
                broker.subscribe("sync", "sync-a"),
                options,
            )),
            codec.clone(),
            Arc::new(ClientRegistry::in_memory(ClientId::random())),
            SharedStore::new(memory.clone()),
            BackpressureMonitor::new(ThrottlePolicy {
                threshold: 10,
                defer: Duration::from_millis(1),
                max_deferrals: 1,
            }),
        );
        Setup {
            broker,
            codec,
            memory,
            engine,
        }
    }

    fn client(n: u8) -> ClientId {
        ClientId::from_bytes(&[n; 32]).unwrap()
    }

    fn record(id: &str, at: u64, by: ClientId, value: &str) -> Record {
        Record::new(id, at, by, json!({ "v": value }))
    }

    fn snapshot_from(
        codec: &EnvelopeCodec,
        sender: ClientId,
        revision: u64,
        records: Vec<Record>,
    ) -> Opened {
        let snapshot = Snapshot {
            revision: Revision::new(revision),
            originating_client_id: sender,
            records,
        };
        let envelope = codec
            .seal(MessageType::StateSnapshot, sender, &snapshot.to_bytes().unwrap())
            .unwrap();
        codec.open(&envelope).unwrap()
    }

    // ===========================================
    // Push
    // ===========================================

    #[tokio::test]
    async fn push_sends_store_contents_with_next_revision() {
        let me = client(1);
        let s = setup(vec![record("a", 1, me, "x")]);

        let first = s.engine.push_snapshot().await.unwrap();
        let second = s.engine.push_snapshot().await.unwrap();
        assert!(matches!(first, PushOutcome::Pushed { revision, records: 1, .. } if revision == Revision::new(1)));
        assert!(matches!(second, PushOutcome::Pushed { revision, .. } if revision == Revision::new(2)));

        let reader = s.broker.subscribe("sync", "sync-a");
        let msgs = reader.poll(10, Duration::ZERO).await.unwrap();
        assert_eq!(msgs.len(), 2);
        let opened = s.codec.open_body(&msgs[0].body).unwrap();
        assert_eq!(opened.message_type, MessageType::StateSnapshot);
        let snapshot = Snapshot::from_bytes(&opened.plaintext).unwrap();
        assert_eq!(snapshot.originating_client_id, s.engine.client_id());
        assert_eq!(snapshot.records, s.memory.records());
    }

    #[tokio::test]
    async fn push_skipped_when_backlogged() {
        let s = setup(vec![]);
        for i in 0..11 {
            s.broker.inject("sync-a", &i.to_string());
        }

        assert_eq!(
            s.engine.push_snapshot().await.unwrap(),
            PushOutcome::Skipped { depth: 11 }
        );
        assert_eq!(s.engine.registry().current_revision().await, Revision::zero());
    }

    #[tokio::test]
    async fn push_failure_is_reported() {
        let s = setup(vec![]);
        s.broker
            .fail_next(MockOp::Push, TransportError::Unauthorized("denied".into()));

        assert!(matches!(
            s.engine.push_snapshot().await,
            Err(EngineError::Transport(TransportError::Unauthorized(_)))
        ));
    }

    // ===========================================
    // Merge
    // ===========================================

    #[tokio::test]
    async fn peer_snapshot_is_merged() {
        let s = setup(vec![record("a", 1, client(1), "mine")]);
        let peer = client(2);
        let opened = snapshot_from(&s.codec, peer, 1, vec![record("b", 2, peer, "theirs")]);

        let outcome = s.engine.on_snapshot(&opened).await.unwrap();
        assert!(matches!(outcome, SnapshotOutcome::Applied(stats) if stats.inserted == 1));
        assert_eq!(s.memory.records().len(), 2);
        assert_eq!(
            s.engine.registry().peer_revision(&peer).await,
            Some(Revision::new(1))
        );
    }

    #[tokio::test]
    async fn self_echo_leaves_state_unchanged() {
        let s = setup(vec![record("a", 1, client(1), "mine")]);
        let me = s.engine.client_id();
        let opened = snapshot_from(&s.codec, me, 7, vec![record("a", 99, me, "echo")]);

        assert_eq!(
            s.engine.on_snapshot(&opened).await.unwrap(),
            SnapshotOutcome::SelfEcho
        );
        assert_eq!(s.memory.get("a").unwrap().updated_at, 1);
        assert_eq!(s.memory.apply_count(), 0);
    }

    #[tokio::test]
    async fn older_revision_is_discarded_not_merged() {
        let s = setup(vec![]);
        let x = client(9);
        let newer = snapshot_from(&s.codec, x, 5, vec![record("r", 50, x, "v5")]);
        let older = snapshot_from(&s.codec, x, 3, vec![record("other", 30, x, "v3")]);

        s.engine.on_snapshot(&newer).await.unwrap();
        assert_eq!(
            s.engine.on_snapshot(&older).await.unwrap(),
            SnapshotOutcome::Stale {
                seen: Revision::new(5)
            }
        );
        assert!(s.memory.get("other").is_none());
    }

    #[tokio::test]
    async fn redelivered_snapshot_is_stale() {
        let s = setup(vec![]);
        let peer = client(2);
        let opened = snapshot_from(&s.codec, peer, 1, vec![record("a", 1, peer, "x")]);

        s.engine.on_snapshot(&opened).await.unwrap();
        assert!(matches!(
            s.engine.on_snapshot(&opened).await.unwrap(),
            SnapshotOutcome::Stale { .. }
        ));
        assert_eq!(s.memory.apply_count(), 1);
    }

    #[tokio::test]
    async fn unchanged_merge_skips_apply_but_records_revision() {
        let peer = client(2);
        let existing = record("a", 5, peer, "x");
        let s = setup(vec![existing.clone()]);
        let opened = snapshot_from(&s.codec, peer, 4, vec![existing]);

        assert!(matches!(
            s.engine.on_snapshot(&opened).await.unwrap(),
            SnapshotOutcome::Unchanged(_)
        ));
        assert_eq!(s.memory.apply_count(), 0);
        assert_eq!(
            s.engine.registry().peer_revision(&peer).await,
            Some(Revision::new(4))
        );
    }

    #[tokio::test]
    async fn failed_apply_is_not_recorded() {
        let s = setup(vec![]);
        let peer = client(2);
        let opened = snapshot_from(&s.codec, peer, 1, vec![record("a", 1, peer, "x")]);
        s.memory.fail_next_apply("disk full");

        assert!(matches!(
            s.engine.on_snapshot(&opened).await,
            Err(EngineError::Store(_))
        ));
        assert_eq!(s.engine.registry().peer_revision(&peer).await, None);

        // Redelivery succeeds
        assert!(matches!(
            s.engine.on_snapshot(&opened).await.unwrap(),
            SnapshotOutcome::Applied(_)
        ));
    }

    #[tokio::test]
    async fn refused_apply_is_discarded_as_malformed() {
        let s = setup(vec![]);
        let peer = client(2);
        let opened = snapshot_from(&s.codec, peer, 1, vec![record("a", 1, peer, "x")]);
        s.memory.reject_next_apply("record a is its own parent");

        assert_eq!(
            s.engine.on_snapshot(&opened).await.unwrap(),
            SnapshotOutcome::Malformed("record a is its own parent".into())
        );
        assert!(s.memory.records().is_empty());
        assert_eq!(s.engine.registry().peer_revision(&peer).await, None);

        // The peer's next snapshot still gets through
        let next = snapshot_from(&s.codec, peer, 2, vec![record("b", 2, peer, "y")]);
        assert!(matches!(
            s.engine.on_snapshot(&next).await.unwrap(),
            SnapshotOutcome::Applied(_)
        ));
    }

    #[tokio::test]
    async fn timestamp_out_of_range_is_malformed() {
        let s = setup(vec![]);
        let peer = client(2);
        let opened = snapshot_from(
            &s.codec,
            peer,
            1,
            vec![record("a", 1, peer, "x"), record("b", u64::MAX, peer, "y")],
        );

        assert!(matches!(
            s.engine.on_snapshot(&opened).await.unwrap(),
            SnapshotOutcome::Malformed(_)
        ));
        assert!(s.memory.records().is_empty());
        assert_eq!(s.memory.apply_count(), 0);
    }

    #[tokio::test]
    async fn mismatched_origin_is_malformed() {
        let s = setup(vec![]);
        let snapshot = Snapshot {
            revision: Revision::new(1),
            originating_client_id: client(3),
            records: vec![record("a", 1, client(3), "x")],
        };
        let envelope = s
            .codec
            .seal(
                MessageType::StateSnapshot,
                client(2),
                &snapshot.to_bytes().unwrap(),
            )
            .unwrap();
        let opened = s.codec.open(&envelope).unwrap();

        assert!(matches!(
            s.engine.on_snapshot(&opened).await.unwrap(),
            SnapshotOutcome::Malformed(_)
        ));
        assert!(s.memory.records().is_empty());
    }

    // ===========================================
    // Push loop
    // ===========================================

    #[tokio::test]
    async fn local_change_triggers_push() {
        let s = Arc::new(setup(vec![]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = s.clone();
        let task = tokio::spawn(async move {
            engine
                .engine
                .run_push_loop(Duration::from_secs(3600), shutdown_rx)
                .await
        });

        // Startup push
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.broker.published(), 1);

        s.engine
            .record_local_change(record("a", 1, client(1), "x"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.broker.published(), 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
