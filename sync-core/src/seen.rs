//! Bounded window of recently processed message ids.
//!
//! The queue delivers at least once. Commands have side effects outside the
//! engine, so a redelivered command must be recognised and dropped. The
//! window keeps the most recent `capacity` ids:
//! 1. `insert()` - record an id, evicting the oldest when full
//! 2. `contains()` - check before dispatching

use std::collections::{HashSet, VecDeque};
use sync_types::MessageId;

/// FIFO-evicting set of message ids.
#[derive(Debug, Clone)]
pub struct SeenMessages {
    /// Maximum number of ids remembered.
    capacity: usize,
    /// Insertion order, oldest first.
    order: VecDeque<MessageId>,
    /// Membership index.
    ids: HashSet<MessageId>,
}

impl SeenMessages {
    /// Create a window remembering at most `capacity` ids.
    ///
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Whether `id` is in the window.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Record `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id);
        self.ids.insert(id);
        true
    }

    /// Number of ids remembered.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of ids remembered.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
