//! Per-peer snapshot revision bookkeeping.
//!
//! Each client counts its own snapshot pushes. A receiver remembers the
//! highest revision it has applied from every peer and uses it to drop
//! self-echoes, redeliveries and snapshots overtaken by a newer one.

use std::collections::HashMap;
use sync_types::{ClientId, Revision};

/// What to do with an incoming snapshot before merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotDecision {
    /// Our own snapshot came back through the queue. Ack and discard.
    SelfEcho,
    /// Already applied this revision or a newer one from this peer.
    Stale {
        /// Highest revision recorded for the peer.
        seen: Revision,
    },
    /// Merge it.
    Apply,
}

/// Highest applied revision per peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerRevisions {
    seen: HashMap<ClientId, Revision>,
}

impl PeerRevisions {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest revision applied from `peer`, if any.
    pub fn get(&self, peer: &ClientId) -> Option<Revision> {
        self.seen.get(peer).copied()
    }

    /// Classify an incoming snapshot.
    pub fn classify(
        &self,
        local: &ClientId,
        sender: &ClientId,
        revision: Revision,
    ) -> SnapshotDecision {
        if sender == local {
            return SnapshotDecision::SelfEcho;
        }
        match self.get(sender) {
            Some(seen) if seen >= revision => SnapshotDecision::Stale { seen },
            _ => SnapshotDecision::Apply,
        }
    }

    /// Record that `revision` from `peer` has been applied.
    ///
    /// Never moves a peer backwards. Returns true if the table changed.
    pub fn record(&mut self, peer: ClientId, revision: Revision) -> bool {
        match self.seen.get(&peer) {
            Some(seen) if *seen >= revision => false,
            _ => {
                self.seen.insert(peer, revision);
                true
            }
        }
    }

    /// Number of peers tracked.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no peer has been recorded.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Iterate over `(peer, revision)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &Revision)> {
        self.seen.iter()
    }
}

impl FromIterator<(ClientId, Revision)> for PeerRevisions {
    fn from_iter<I: IntoIterator<Item = (ClientId, Revision)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (peer, revision) in iter {
            table.record(peer, revision);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_snapshot_is_self_echo() {
        let me = ClientId::random();
        let table = PeerRevisions::new();
        assert_eq!(
            table.classify(&me, &me, Revision::new(1)),
            SnapshotDecision::SelfEcho
        );
    }

    #[test]
    fn first_snapshot_from_peer_applies() {
        let (me, peer) = (ClientId::random(), ClientId::random());
        let table = PeerRevisions::new();
        assert_eq!(
            table.classify(&me, &peer, Revision::new(1)),
            SnapshotDecision::Apply
        );
    }

    #[test]
    fn older_and_equal_revisions_are_stale() {
        let (me, x) = (ClientId::random(), ClientId::random());
        let mut table = PeerRevisions::new();
        table.record(x, Revision::new(5));

        assert_eq!(
            table.classify(&me, &x, Revision::new(3)),
            SnapshotDecision::Stale {
                seen: Revision::new(5)
            }
        );
        assert!(matches!(
            table.classify(&me, &x, Revision::new(5)),
            SnapshotDecision::Stale { .. }
        ));
        assert_eq!(
            table.classify(&me, &x, Revision::new(6)),
            SnapshotDecision::Apply
        );
    }

    #[test]
    fn record_never_regresses() {
        let peer = ClientId::random();
        let mut table = PeerRevisions::new();

        assert!(table.record(peer, Revision::new(7)));
        assert!(!table.record(peer, Revision::new(4)));
        assert!(!table.record(peer, Revision::new(7)));
        assert_eq!(table.get(&peer), Some(Revision::new(7)));
    }

    #[test]
    fn peers_are_independent() {
        let (a, b) = (ClientId::random(), ClientId::random());
        let table: PeerRevisions = [(a, Revision::new(9)), (b, Revision::new(2))]
            .into_iter()
            .collect();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&a), Some(Revision::new(9)));
        assert_eq!(table.get(&b), Some(Revision::new(2)));
    }
}
