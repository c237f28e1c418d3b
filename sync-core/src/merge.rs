//! Last-writer-wins merge of full-state snapshots.
//!
//! Every record version is ordered by the key
//! `(updated_at, updated_by, deleted, parent_id, body)`; for each record id the
//! greatest version survives. Because this is a total order and the merge
//! keeps the maximum per id, merging is commutative, associative and
//! idempotent: any set of snapshots applied in any order, any number of
//! times, yields the same store.
//!
//! Records present locally but absent from the incoming snapshot are kept.
//! Deletion travels only as a tombstone (`deleted == true`) that wins the
//! ordering like any other write.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use sync_types::Record;

/// Counters describing what a merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Records that did not exist locally.
    pub inserted: usize,
    /// Local records replaced by a newer incoming version.
    pub updated: usize,
    /// Incoming records that lost to (or equalled) the local version.
    pub unchanged: usize,
    /// Inserted or updated records that are tombstones.
    pub tombstoned: usize,
}

/// Result of merging an incoming snapshot into local state.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The complete merged record set, ordered by id.
    pub records: Vec<Record>,
    /// What changed.
    pub stats: MergeStats,
}

impl MergeOutcome {
    /// Whether applying this outcome would change local state.
    pub fn changed(&self) -> bool {
        self.stats.inserted + self.stats.updated > 0
    }
}

/// Total order over two versions of the same record.
///
/// `Greater` means `a` wins over `b`. Later `updated_at` wins; an exact tie is
/// broken by the writing client id (byte-wise), then by content so that two
/// different versions never compare equal.
pub fn compare_versions(a: &Record, b: &Record) -> Ordering {
    a.updated_at
        .cmp(&b.updated_at)
        .then_with(|| a.updated_by.cmp(&b.updated_by))
        .then_with(|| a.deleted.cmp(&b.deleted))
        .then_with(|| a.parent_id.cmp(&b.parent_id))
        .then_with(|| a.body.to_string().cmp(&b.body.to_string()))
}

/// Merge `incoming` into `local`.
///
/// Pure: neither input is modified. The caller applies
/// [`MergeOutcome::records`] atomically.
pub fn merge(local: &[Record], incoming: &[Record]) -> MergeOutcome {
    let mut merged: BTreeMap<String, Record> = BTreeMap::new();
    for record in local {
        match merged.get(&record.id) {
            Some(existing) if compare_versions(record, existing) != Ordering::Greater => {}
            _ => {
                merged.insert(record.id.clone(), record.clone());
            }
        }
    }

    let mut stats = MergeStats::default();
    for record in incoming {
        match merged.get(&record.id) {
            None => {
                stats.inserted += 1;
                if record.deleted {
                    stats.tombstoned += 1;
                }
                merged.insert(record.id.clone(), record.clone());
            }
            Some(existing) => {
                if compare_versions(record, existing) == Ordering::Greater {
                    stats.updated += 1;
                    if record.deleted && !existing.deleted {
                        stats.tombstoned += 1;
                    }
                    merged.insert(record.id.clone(), record.clone());
                } else {
                    stats.unchanged += 1;
                }
            }
        }
    }

    MergeOutcome {
        records: merged.into_values().collect(),
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_types::ClientId;

    fn client(byte: u8) -> ClientId {
        ClientId::from_bytes(&[byte; 32]).unwrap()
    }

    fn rec(id: &str, at: u64, by: ClientId, body: serde_json::Value) -> Record {
        Record::new(id, at, by, body)
    }

    fn body_of<'a>(records: &'a [Record], id: &str) -> &'a serde_json::Value {
        &records.iter().find(|r| r.id == id).unwrap().body
    }

    // ===========================================
    // Basic Merge Tests
    // ===========================================

    #[test]
    fn absent_records_are_inserted() {
        let a = client(1);
        let local = vec![rec("x", 1, a, json!("x"))];
        let incoming = vec![rec("y", 1, a, json!("y"))];

        let outcome = merge(&local, &incoming);

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.stats.inserted, 1);
        assert!(outcome.changed());
    }

    #[test]
    fn absence_never_deletes() {
        let a = client(1);
        let local = vec![rec("x", 1, a, json!(1)), rec("y", 1, a, json!(2))];

        let outcome = merge(&local, &[]);

        assert_eq!(outcome.records, local);
        assert!(!outcome.changed());
    }

    #[test]
    fn newer_incoming_replaces_local() {
        let (a, b) = (client(1), client(2));
        let local = vec![rec("x", 100, a, json!("old"))];
        let incoming = vec![rec("x", 200, b, json!("new"))];

        let outcome = merge(&local, &incoming);

        assert_eq!(body_of(&outcome.records, "x"), &json!("new"));
        assert_eq!(outcome.stats.updated, 1);
    }

    #[test]
    fn older_incoming_is_ignored() {
        let (a, b) = (client(1), client(2));
        let local = vec![rec("x", 200, a, json!("kept"))];
        let incoming = vec![rec("x", 100, b, json!("stale"))];

        let outcome = merge(&local, &incoming);

        assert_eq!(body_of(&outcome.records, "x"), &json!("kept"));
        assert_eq!(outcome.stats.unchanged, 1);
        assert!(!outcome.changed());
    }

    // ===========================================
    // Convergence Properties
    // ===========================================

    #[test]
    fn merge_is_idempotent() {
        let (a, b) = (client(1), client(2));
        let local = vec![rec("x", 1, a, json!(1))];
        let incoming = vec![rec("x", 5, b, json!(5)), rec("z", 3, b, json!(3))];

        let once = merge(&local, &incoming);
        let twice = merge(&once.records, &incoming);

        assert_eq!(once.records, twice.records);
        assert!(!twice.changed());
    }

    #[test]
    fn last_writer_wins_regardless_of_order() {
        let (a, b) = (client(1), client(2));
        let from_a = vec![rec("x", 1_000, a, json!("A"))];
        let from_b = vec![rec("x", 2_000, b, json!("B"))];

        let ab = merge(&merge(&[], &from_a).records, &from_b);
        let ba = merge(&merge(&[], &from_b).records, &from_a);

        assert_eq!(body_of(&ab.records, "x"), &json!("B"));
        assert_eq!(ab.records, ba.records);
    }

    #[test]
    fn timestamp_tie_breaks_on_client_id() {
        let (low, high) = (client(0x10), client(0xF0));
        let from_low = vec![rec("x", 500, low, json!("low"))];
        let from_high = vec![rec("x", 500, high, json!("high"))];

        // Merge performed on "either client" in either order
        let on_low = merge(&from_low, &from_high);
        let on_high = merge(&from_high, &from_low);

        assert_eq!(body_of(&on_low.records, "x"), &json!("high"));
        assert_eq!(on_low.records, on_high.records);
    }

    #[test]
    fn identical_keys_with_different_bodies_still_converge() {
        let a = client(1);
        let one = vec![rec("x", 7, a, json!({"v": 1}))];
        let two = vec![rec("x", 7, a, json!({"v": 2}))];

        assert_eq!(merge(&one, &two).records, merge(&two, &one).records);
    }

    #[test]
    fn disjoint_snapshots_union() {
        let (a, b) = (client(1), client(2));
        let store_a = vec![rec("a1", 1, a, json!(1)), rec("a2", 2, a, json!(2))];
        let store_b = vec![rec("b1", 3, b, json!(3))];

        let on_a = merge(&store_a, &store_b);
        let on_b = merge(&store_b, &store_a);

        assert_eq!(on_a.records.len(), 3);
        assert_eq!(on_a.records, on_b.records);
    }

    // ===========================================
    // Tombstone Tests
    // ===========================================

    #[test]
    fn newer_tombstone_deletes() {
        let (a, b) = (client(1), client(2));
        let local = vec![rec("x", 1, a, json!("live"))];
        let incoming = vec![rec("x", 1, a, json!("live")).into_tombstone(9, b)];

        let outcome = merge(&local, &incoming);

        assert!(outcome.records[0].deleted);
        assert_eq!(outcome.stats.tombstoned, 1);
    }

    #[test]
    fn newer_write_resurrects_over_older_tombstone() {
        let (a, b) = (client(1), client(2));
        let local = vec![rec("x", 1, a, json!(null)).into_tombstone(5, a)];
        let incoming = vec![rec("x", 8, b, json!("back"))];

        let outcome = merge(&local, &incoming);

        assert!(!outcome.records[0].deleted);
        assert_eq!(body_of(&outcome.records, "x"), &json!("back"));
    }

    #[test]
    fn duplicate_ids_in_incoming_resolve_deterministically() {
        let a = client(1);
        let incoming = vec![rec("x", 9, a, json!("late")), rec("x", 3, a, json!("early"))];
        let reversed: Vec<Record> = incoming.iter().rev().cloned().collect();

        assert_eq!(merge(&[], &incoming).records, merge(&[], &reversed).records);
        assert_eq!(body_of(&merge(&[], &incoming).records, "x"), &json!("late"));
    }
}
