//! Backpressure monitor.
//!
//! Producers ask the monitor before pushing. When the publish destination's
//! backlog exceeds the threshold (typically because a peer has been offline
//! for a while) the producer waits and re-checks instead of growing the
//! queue without bound.

use sync_core::ThrottlePolicy;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::transport::QueueTransport;

/// Result of waiting for queue capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead and push.
    Proceed {
        /// How many times the producer was deferred first.
        deferrals: u32,
    },
    /// Still over the threshold after the last allowed deferral.
    Saturated {
        /// Last observed depth.
        depth: u64,
    },
}

/// Consults queue depth against a [`ThrottlePolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BackpressureMonitor {
    policy: ThrottlePolicy,
}

impl BackpressureMonitor {
    /// Create a monitor.
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self { policy }
    }

    /// The policy in use.
    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    /// Whether producers on `connection` should hold off right now.
    ///
    /// A failed depth query reports "not throttled": the push that follows
    /// will surface the real transport error.
    pub async fn should_throttle<T: QueueTransport>(&self, connection: &Connection<T>) -> bool {
        self.observe(connection).await.1
    }

    /// Defer while throttled, up to `max_deferrals` times.
    pub async fn wait_for_capacity<T: QueueTransport>(
        &self,
        connection: &Connection<T>,
    ) -> Admission {
        let mut deferrals = 0;
        loop {
            let (depth, throttled) = self.observe(connection).await;
            if !throttled {
                return Admission::Proceed { deferrals };
            }
            if deferrals >= self.policy.max_deferrals {
                warn!(
                    queue = %connection.name(),
                    depth,
                    threshold = self.policy.threshold,
                    deferrals,
                    "queue backlog did not drain, giving up on this push"
                );
                return Admission::Saturated { depth };
            }

            deferrals += 1;
            debug!(
                queue = %connection.name(),
                depth,
                threshold = self.policy.threshold,
                deferral = deferrals,
                "queue backlogged, deferring push"
            );
            tokio::time::sleep(self.policy.defer).await;
        }
    }

    async fn observe<T: QueueTransport>(&self, connection: &Connection<T>) -> (u64, bool) {
        match connection.queue_depth().await {
            Ok(depth) => (depth, self.policy.is_throttled(depth)),
            Err(error) => {
                warn!(queue = %connection.name(), %error, "queue depth unavailable, not throttling");
                (0, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::transport::{MockBroker, MockOp, MockQueue, TransportError};
    use std::time::Duration;
    use sync_core::RetryPolicy;

    fn setup(threshold: u64) -> (MockBroker, Connection<MockQueue>, BackpressureMonitor) {
        let broker = MockBroker::new();
        let producer = broker.subscribe("sync", "sync-a");
        // An idle subscriber whose inbox only grows
        let _offline = broker.subscribe("sync", "sync-b");
        let options = ConnectionOptions {
            retry: RetryPolicy::no_retry(),
            ..ConnectionOptions::default()
        };
        let monitor = BackpressureMonitor::new(ThrottlePolicy {
            threshold,
            defer: Duration::from_millis(5),
            max_deferrals: 2,
        });
        (broker, Connection::new("sync", producer, options), monitor)
    }

    #[tokio::test]
    async fn below_threshold_is_not_throttled() {
        let (_broker, conn, monitor) = setup(3);
        conn.push("1").await.unwrap();
        assert!(!monitor.should_throttle(&conn).await);
        assert_eq!(
            monitor.wait_for_capacity(&conn).await,
            Admission::Proceed { deferrals: 0 }
        );
    }

    #[tokio::test]
    async fn above_threshold_defers_then_saturates() {
        let (_broker, conn, monitor) = setup(2);
        for i in 0..3 {
            conn.push(&i.to_string()).await.unwrap();
        }

        assert!(monitor.should_throttle(&conn).await);
        assert_eq!(
            monitor.wait_for_capacity(&conn).await,
            Admission::Saturated { depth: 3 }
        );
    }

    #[tokio::test]
    async fn proceeds_once_backlog_drains() {
        let (broker, conn, monitor) = setup(1);
        conn.push("a").await.unwrap();
        conn.push("b").await.unwrap();

        let inboxes = [
            broker.subscribe("sync", "sync-a"),
            broker.subscribe("sync", "sync-b"),
        ];
        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            for inbox in &inboxes {
                for m in inbox.poll(10, Duration::ZERO).await.unwrap() {
                    inbox.acknowledge(&m.receipt).await.unwrap();
                }
            }
        });

        let monitor = BackpressureMonitor::new(ThrottlePolicy {
            max_deferrals: 50,
            ..*monitor.policy()
        });
        let admission = monitor.wait_for_capacity(&conn).await;
        drain.await.unwrap();

        assert!(matches!(admission, Admission::Proceed { deferrals } if deferrals >= 1));
    }

    #[tokio::test]
    async fn depth_failure_is_not_throttled() {
        let (broker, conn, monitor) = setup(0);
        conn.push("x").await.unwrap();
        broker.fail_next(MockOp::Depth, TransportError::Unauthorized("nope".into()));

        assert!(!monitor.should_throttle(&conn).await);
        assert!(monitor.should_throttle(&conn).await);
    }
}
