//! In-memory queue broker for testing and `--mock` runs.
//!
//! Models the delivery topology the engine is deployed against: a publish
//! destination fans out to every inbox subscribed to it, each inbox hands a
//! message to one poller at a time, and a received message stays in flight
//! until acknowledged. [`MockBroker::expire_in_flight`] plays the role of the
//! visibility timeout, returning unacknowledged messages for redelivery.
//!
//! Failures can be injected per operation with [`MockBroker::fail_next`].

use super::{QueueDepth, QueueMessage, QueueTransport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Queue operation, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `health_check()`
    HealthCheck,
    /// `push()`
    Push,
    /// `poll()`
    Poll,
    /// `acknowledge()`
    Acknowledge,
    /// `queue_depth()`
    Depth,
}

/// Shared in-memory broker.
///
/// Cloning shares state, so one broker can serve several simulated clients.
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    inner: Arc<Mutex<BrokerInner>>,
    arrivals: Arc<Notify>,
}

#[derive(Debug, Default)]
struct BrokerInner {
    /// Publish destination -> subscribed inboxes.
    subscriptions: HashMap<String, Vec<String>>,
    /// Inbox name -> contents.
    queues: HashMap<String, InboxState>,
    /// Pending injected failures, consumed in order.
    failures: HashMap<MockOp, VecDeque<TransportError>>,
    next_id: u64,
    published: u64,
}

#[derive(Debug, Default)]
struct InboxState {
    available: VecDeque<Stored>,
    in_flight: HashMap<String, Stored>,
}

#[derive(Debug, Clone)]
struct Stored {
    body: String,
}

impl MockBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create `inbox` (if needed), subscribe it to `publish`, and return a
    /// transport that publishes to `publish` and reads from `inbox`.
    pub fn subscribe(&self, publish: &str, inbox: &str) -> MockQueue {
        let mut inner = self.lock();
        inner.queues.entry(inbox.to_string()).or_default();
        let subscribers = inner.subscriptions.entry(publish.to_string()).or_default();
        if !subscribers.iter().any(|s| s == inbox) {
            subscribers.push(inbox.to_string());
        }
        MockQueue {
            broker: self.clone(),
            publish: publish.to_string(),
            inbox: inbox.to_string(),
        }
    }

    /// Delete an inbox. Subsequent calls against it fail with `QueueNotFound`.
    pub fn delete_queue(&self, inbox: &str) {
        let mut inner = self.lock();
        inner.queues.remove(inbox);
        for subscribers in inner.subscriptions.values_mut() {
            subscribers.retain(|s| s != inbox);
        }
    }

    /// Put a raw body straight into one inbox, bypassing fan-out.
    pub fn inject(&self, inbox: &str, body: &str) {
        let mut inner = self.lock();
        if let Some(queue) = inner.queues.get_mut(inbox) {
            queue.available.push_back(Stored {
                body: body.to_string(),
            });
        }
        drop(inner);
        self.arrivals.notify_waiters();
    }

    /// Return every in-flight message of `inbox` for redelivery, as if the
    /// visibility timeout had expired. Returns how many were returned.
    pub fn expire_in_flight(&self, inbox: &str) -> usize {
        let mut inner = self.lock();
        let count = match inner.queues.get_mut(inbox) {
            Some(queue) => {
                let mut returned: Vec<Stored> =
                    queue.in_flight.drain().map(|(_, stored)| stored).collect();
                let count = returned.len();
                // Redeliveries go first, like an expired message at the head
                returned.reverse();
                for stored in returned {
                    queue.available.push_front(stored);
                }
                count
            }
            None => 0,
        };
        drop(inner);
        self.arrivals.notify_waiters();
        count
    }

    /// Depth of one inbox.
    pub fn depth(&self, inbox: &str) -> QueueDepth {
        let inner = self.lock();
        inner
            .queues
            .get(inbox)
            .map(InboxState::depth)
            .unwrap_or_default()
    }

    /// Total number of successful pushes.
    pub fn published(&self) -> u64 {
        self.lock().published
    }

    /// Make the next `op` fail with `error`. Calls queue up in order.
    pub fn fail_next(&self, op: MockOp, error: TransportError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Make the next `times` calls of `op` fail with `error`.
    pub fn fail_times(&self, op: MockOp, error: TransportError, times: usize) {
        let mut inner = self.lock();
        let pending = inner.failures.entry(op).or_default();
        for _ in 0..times {
            pending.push_back(error.clone());
        }
    }

    /// Drop all pending injected failures.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }
}

impl BrokerInner {
    fn take_failure(&mut self, op: MockOp) -> Result<(), TransportError> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn queue_mut(&mut self, inbox: &str) -> Result<&mut InboxState, TransportError> {
        self.queues
            .get_mut(inbox)
            .ok_or_else(|| TransportError::QueueNotFound(inbox.to_string()))
    }

    fn receive(&mut self, inbox: &str, max: usize) -> Result<Vec<QueueMessage>, TransportError> {
        let mut received = Vec::new();
        while received.len() < max {
            let receipt = format!("rcpt-{}", self.next_id);
            let queue = self.queue_mut(inbox)?;
            let Some(stored) = queue.available.pop_front() else {
                break;
            };
            received.push(QueueMessage {
                body: stored.body.clone(),
                receipt: receipt.clone(),
            });
            queue.in_flight.insert(receipt, stored);
            self.next_id += 1;
        }
        Ok(received)
    }
}

impl InboxState {
    fn depth(&self) -> QueueDepth {
        QueueDepth {
            available: self.available.len() as u64,
            in_flight: self.in_flight.len() as u64,
        }
    }
}

/// One client's view of the broker: a publish destination and an inbox.
#[derive(Debug, Clone)]
pub struct MockQueue {
    broker: MockBroker,
    publish: String,
    inbox: String,
}

impl MockQueue {
    /// The inbox this transport reads.
    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    /// The broker behind this transport.
    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }
}

#[async_trait]
impl QueueTransport for MockQueue {
    async fn health_check(&self) -> Result<(), TransportError> {
        let mut inner = self.broker.lock();
        inner.take_failure(MockOp::HealthCheck)?;
        inner.queue_mut(&self.inbox).map(|_| ())
    }

    async fn push(&self, body: &str) -> Result<String, TransportError> {
        let mut inner = self.broker.lock();
        inner.take_failure(MockOp::Push)?;

        let subscribers = inner
            .subscriptions
            .get(&self.publish)
            .cloned()
            .unwrap_or_default();
        for inbox in &subscribers {
            if let Some(queue) = inner.queues.get_mut(inbox) {
                queue.available.push_back(Stored {
                    body: body.to_string(),
                });
            }
        }

        let message_id = format!("msg-{}", inner.next_id);
        inner.next_id += 1;
        inner.published += 1;
        drop(inner);

        self.broker.arrivals.notify_waiters();
        Ok(message_id)
    }

    async fn poll(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, TransportError> {
        self.broker.lock().take_failure(MockOp::Poll)?;

        let deadline = Instant::now() + wait;
        let max = max_messages.max(1) as usize;
        loop {
            // Register interest before checking so a concurrent push is not missed
            let arrived = self.broker.arrivals.notified();

            let received = self.broker.lock().receive(&self.inbox, max)?;
            if !received.is_empty() {
                return Ok(received);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, arrived).await;
        }
    }

    async fn acknowledge(&self, receipt: &str) -> Result<(), TransportError> {
        let mut inner = self.broker.lock();
        inner.take_failure(MockOp::Acknowledge)?;
        // Unknown receipts are ignored, like deleting an already-deleted message
        inner.queue_mut(&self.inbox)?.in_flight.remove(receipt);
        Ok(())
    }

    async fn queue_depth(&self) -> Result<QueueDepth, TransportError> {
        let mut inner = self.broker.lock();
        inner.take_failure(MockOp::Depth)?;

        // A fan-out destination is as backed up as its slowest subscriber
        match inner.subscriptions.get(&self.publish).cloned() {
            Some(subscribers) => Ok(subscribers
                .iter()
                .filter_map(|inbox| inner.queues.get(inbox))
                .map(InboxState::depth)
                .max_by_key(QueueDepth::total)
                .unwrap_or_default()),
            None => inner.queue_mut(&self.publish).map(|queue| queue.depth()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // Fan-out and delivery
    // ===========================================

    #[tokio::test]
    async fn push_fans_out_to_every_inbox() {
        let broker = MockBroker::new();
        let a = broker.subscribe("sync", "sync-a");
        let b = broker.subscribe("sync", "sync-b");

        a.push("hello").await.unwrap();

        let got_a = a.poll(10, Duration::ZERO).await.unwrap();
        let got_b = b.poll(10, Duration::ZERO).await.unwrap();
        assert_eq!(got_a.len(), 1);
        assert_eq!(got_b.len(), 1);
        assert_eq!(got_b[0].body, "hello");
        assert_eq!(broker.published(), 1);
    }

    #[tokio::test]
    async fn poll_respects_max_messages() {
        let broker = MockBroker::new();
        let q = broker.subscribe("cmd", "cmd-a");
        for i in 0..5 {
            q.push(&format!("m{i}")).await.unwrap();
        }

        let first = q.poll(2, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].body, "m0");
        assert_eq!(
            broker.depth("cmd-a"),
            QueueDepth {
                available: 3,
                in_flight: 2
            }
        );
    }

    #[tokio::test]
    async fn acknowledged_message_is_gone() {
        let broker = MockBroker::new();
        let q = broker.subscribe("cmd", "cmd-a");
        q.push("once").await.unwrap();

        let msgs = q.poll(1, Duration::ZERO).await.unwrap();
        q.acknowledge(&msgs[0].receipt).await.unwrap();

        assert_eq!(broker.expire_in_flight("cmd-a"), 0);
        assert_eq!(broker.depth("cmd-a").total(), 0);
    }

    #[tokio::test]
    async fn unacknowledged_message_is_redelivered() {
        let broker = MockBroker::new();
        let q = broker.subscribe("cmd", "cmd-a");
        q.push("again").await.unwrap();

        let first = q.poll(1, Duration::ZERO).await.unwrap();
        assert!(q.poll(1, Duration::ZERO).await.unwrap().is_empty());

        assert_eq!(broker.expire_in_flight("cmd-a"), 1);
        let second = q.poll(1, Duration::ZERO).await.unwrap();
        assert_eq!(second[0].body, "again");
        assert_ne!(second[0].receipt, first[0].receipt);
    }

    #[tokio::test]
    async fn long_poll_wakes_on_push() {
        let broker = MockBroker::new();
        let reader = broker.subscribe("sync", "sync-a");
        let writer = broker.subscribe("sync", "sync-b");

        let handle = tokio::spawn(async move { reader.poll(1, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.push("wake").await.unwrap();

        let got = handle.await.unwrap().unwrap();
        assert_eq!(got[0].body, "wake");
    }

    #[tokio::test]
    async fn long_poll_times_out_empty() {
        let broker = MockBroker::new();
        let q = broker.subscribe("sync", "sync-a");
        let got = q.poll(1, Duration::from_millis(30)).await.unwrap();
        assert!(got.is_empty());
    }

    // ===========================================
    // Depth and errors
    // ===========================================

    #[tokio::test]
    async fn depth_reports_slowest_subscriber() {
        let broker = MockBroker::new();
        let a = broker.subscribe("sync", "sync-a");
        let _b = broker.subscribe("sync", "sync-b");

        a.push("1").await.unwrap();
        a.push("2").await.unwrap();
        // a drains its own inbox, b does not
        a.poll(10, Duration::ZERO).await.unwrap();

        assert_eq!(a.queue_depth().await.unwrap().available, 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let broker = MockBroker::new();
        let q = broker.subscribe("cmd", "cmd-a");
        broker.fail_times(MockOp::Push, TransportError::Timeout, 2);

        assert_eq!(q.push("x").await, Err(TransportError::Timeout));
        assert_eq!(q.push("x").await, Err(TransportError::Timeout));
        assert!(q.push("x").await.is_ok());
    }

    #[tokio::test]
    async fn deleted_queue_is_not_found() {
        let broker = MockBroker::new();
        let q = broker.subscribe("cmd", "cmd-a");
        broker.delete_queue("cmd-a");

        assert!(matches!(
            q.health_check().await,
            Err(TransportError::QueueNotFound(_))
        ));
        assert!(matches!(
            q.poll(1, Duration::ZERO).await,
            Err(TransportError::QueueNotFound(_))
        ));
    }
}
