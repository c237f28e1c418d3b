//! Owned queue connection: retry, timeouts and link health around a transport.
//!
//! A [`Connection`] is created explicitly and handed to whoever needs it;
//! there is no process-wide client. Every call runs under a timeout, is
//! retried with capped exponential backoff while the error is transient, and
//! feeds the outcome into a [`LinkState`] that escalates persistent failure
//! to an operator alert.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use sync_core::{LinkAction, LinkEvent, LinkState, RetryPolicy};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::credentials::{CredentialChain, CredentialError};
use crate::transport::{
    HttpQueue, HttpQueueConfig, QueueDepth, QueueMessage, QueueTransport, TransportError,
};

/// Errors establishing a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// No usable credentials.
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// Transport could not be built.
    #[error("cannot build transport: {0}")]
    Transport(#[from] TransportError),

    /// The initial health check failed.
    #[error("health check of queue {queue} failed: {source}")]
    HealthCheck {
        /// Connection name.
        queue: String,
        /// Last error.
        #[source]
        source: TransportError,
    },
}

/// Retry, timeout and alerting knobs for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Backoff for transient errors.
    pub retry: RetryPolicy,
    /// Timeout per call. Polls get their wait time on top.
    pub call_timeout: Duration,
    /// Consecutive failed calls before an operator alert.
    pub alert_after: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(10),
            alert_after: 3,
        }
    }
}

/// A queue transport with retry, timeouts and health tracking.
#[derive(Debug)]
pub struct Connection<T> {
    name: String,
    transport: T,
    options: ConnectionOptions,
    link: Mutex<LinkState>,
}

impl<T: QueueTransport> Connection<T> {
    /// Wrap a transport without contacting the queue.
    pub fn new(name: impl Into<String>, transport: T, options: ConnectionOptions) -> Self {
        Self {
            name: name.into(),
            transport,
            options,
            link: Mutex::new(LinkState::new()),
        }
    }

    /// Wrap a transport and run a health check to fail fast.
    ///
    /// Transient health-check errors are retried per the retry policy.
    pub async fn connect(
        name: impl Into<String>,
        transport: T,
        options: ConnectionOptions,
    ) -> Result<Self, ConnectError> {
        let connection = Self::new(name, transport, options);
        connection.observe(LinkEvent::ConnectRequested);

        let transport = &connection.transport;
        let checked = connection
            .with_retry("health_check", options.call_timeout, || {
                transport.health_check()
            })
            .await;

        match checked {
            Ok(()) => {
                connection.observe(LinkEvent::ConnectSucceeded);
                info!(queue = %connection.name, "queue connection established");
                Ok(connection)
            }
            Err(source) => {
                connection.observe(LinkEvent::ConnectFailed {
                    error: source.to_string(),
                    permanent: !source.is_transient(),
                });
                Err(ConnectError::HealthCheck {
                    queue: connection.name.clone(),
                    source,
                })
            }
        }
    }

    /// Connection name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Current link health.
    pub fn link_state(&self) -> LinkState {
        self.lock_link().clone()
    }

    /// Publish a body.
    pub async fn push(&self, body: &str) -> Result<String, TransportError> {
        let transport = &self.transport;
        self.call("push", self.options.call_timeout, || transport.push(body))
            .await
    }

    /// Long-poll the inbox.
    pub async fn poll(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, TransportError> {
        let transport = &self.transport;
        self.call("poll", self.options.call_timeout + wait, || {
            transport.poll(max_messages, wait)
        })
        .await
    }

    /// Delete a processed message.
    pub async fn acknowledge(&self, receipt: &str) -> Result<(), TransportError> {
        let transport = &self.transport;
        self.call("acknowledge", self.options.call_timeout, || {
            transport.acknowledge(receipt)
        })
        .await
    }

    /// Approximate backlog (available + in flight) of the publish destination.
    pub async fn queue_depth(&self) -> Result<u64, TransportError> {
        self.queue_depth_detail().await.map(|d| d.total())
    }

    /// Backlog split into available and in-flight counts.
    pub async fn queue_depth_detail(&self) -> Result<QueueDepth, TransportError> {
        let transport = &self.transport;
        self.call("queue_depth", self.options.call_timeout, || {
            transport.queue_depth()
        })
        .await
    }

    /// Mark the connection closed. Later calls fail with `Closed`.
    pub fn close(&self) {
        self.observe(LinkEvent::ShutdownRequested);
        debug!(queue = %self.name, "queue connection closed");
    }

    async fn call<R, F, Fut>(
        &self,
        op: &'static str,
        timeout: Duration,
        f: F,
    ) -> Result<R, TransportError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        if self.lock_link().is_closed() {
            return Err(TransportError::Closed);
        }

        let result = self.with_retry(op, timeout, f).await;
        match &result {
            Ok(_) => self.observe(LinkEvent::CallSucceeded),
            Err(e) => self.observe(LinkEvent::CallFailed {
                error: e.to_string(),
                permanent: !e.is_transient(),
            }),
        }
        result
    }

    async fn with_retry<R, F, Fut>(
        &self,
        op: &'static str,
        timeout: Duration,
        f: F,
    ) -> Result<R, TransportError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let policy = self.options.retry;
        let mut attempt = 1;
        loop {
            let error = match tokio::time::timeout(timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout,
            };

            if !error.is_transient() {
                warn!(queue = %self.name, op, %error, "permanent queue error");
                return Err(error);
            }
            if !policy.should_retry(attempt) {
                warn!(queue = %self.name, op, attempt, %error, "giving up after retries");
                return Err(error);
            }

            let delay = policy.delay_for(attempt);
            debug!(
                queue = %self.name,
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %error,
                "transient queue error, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn observe(&self, event: LinkEvent) {
        let actions = {
            let mut link = self.lock_link();
            let (next, actions) = std::mem::take(&mut *link).on_event(event, self.options.alert_after);
            *link = next;
            actions
        };

        for action in actions {
            match action {
                LinkAction::RaiseAlert {
                    consecutive,
                    permanent,
                    error,
                } => {
                    error!(
                        queue = %self.name,
                        consecutive,
                        permanent,
                        %error,
                        "ALERT: queue link keeps failing, operator attention required"
                    );
                }
                LinkAction::Recovered { after_failures } => {
                    info!(queue = %self.name, after_failures, "queue link recovered");
                }
            }
        }
    }
}

/// Resolve credentials, build an [`HttpQueue`] and health-check it.
pub async fn connect_http(
    name: impl Into<String>,
    config: HttpQueueConfig,
    credentials: &CredentialChain,
    options: ConnectionOptions,
) -> Result<Connection<HttpQueue>, ConnectError> {
    let credentials = credentials.resolve()?;
    let transport = HttpQueue::new(config, credentials)?;
    Connection::connect(name, transport, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockBroker, MockOp, MockQueue};

    fn fast_options() -> ConnectionOptions {
        ConnectionOptions {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: Duration::ZERO,
            },
            call_timeout: Duration::from_millis(500),
            alert_after: 2,
        }
    }

    fn queue(broker: &MockBroker) -> MockQueue {
        broker.subscribe("cmd", "cmd-a")
    }

    // ===========================================
    // Connect
    // ===========================================

    #[tokio::test]
    async fn connect_runs_health_check() {
        let broker = MockBroker::new();
        let conn = Connection::connect("cmd", queue(&broker), fast_options())
            .await
            .unwrap();
        assert!(conn.link_state().is_healthy());
    }

    #[tokio::test]
    async fn connect_fails_fast_on_missing_queue() {
        let broker = MockBroker::new();
        let q = queue(&broker);
        broker.delete_queue("cmd-a");

        let err = Connection::connect("cmd", q, fast_options())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectError::HealthCheck {
                source: TransportError::QueueNotFound(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn connect_retries_transient_health_check() {
        let broker = MockBroker::new();
        broker.fail_next(MockOp::HealthCheck, TransportError::Timeout);

        assert!(Connection::connect("cmd", queue(&broker), fast_options())
            .await
            .is_ok());
    }

    // ===========================================
    // Retry
    // ===========================================

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let broker = MockBroker::new();
        let conn = Connection::new("cmd", queue(&broker), fast_options());
        broker.fail_times(
            MockOp::Push,
            TransportError::Unavailable {
                status: 503,
                message: String::new(),
            },
            2,
        );

        assert!(conn.push("x").await.is_ok());
        assert_eq!(broker.published(), 1);
        assert!(conn.link_state().is_healthy());
    }

    #[tokio::test]
    async fn retries_are_capped() {
        let broker = MockBroker::new();
        let conn = Connection::new("cmd", queue(&broker), fast_options());
        broker.fail_times(MockOp::Push, TransportError::Timeout, 3);

        assert_eq!(conn.push("x").await, Err(TransportError::Timeout));
        assert_eq!(broker.published(), 0);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let broker = MockBroker::new();
        let conn = Connection::new("cmd", queue(&broker), fast_options());
        broker.fail_next(MockOp::Push, TransportError::Unauthorized("denied".into()));

        assert!(matches!(
            conn.push("x").await,
            Err(TransportError::Unauthorized(_))
        ));
        // Second call succeeds: the one injected failure was consumed by one attempt
        assert!(conn.push("x").await.is_ok());
    }

    // ===========================================
    // Link health
    // ===========================================

    #[tokio::test]
    async fn repeated_failures_mark_link_failing() {
        let broker = MockBroker::new();
        let conn = Connection::new("cmd", queue(&broker), fast_options());
        broker.fail_times(MockOp::Depth, TransportError::Unauthorized("x".into()), 3);

        for _ in 0..3 {
            assert!(conn.queue_depth().await.is_err());
        }
        assert_eq!(conn.link_state().consecutive_failures(), 3);

        assert!(conn.queue_depth().await.is_ok());
        assert!(conn.link_state().is_healthy());
    }

    #[tokio::test]
    async fn closed_connection_refuses_calls() {
        let broker = MockBroker::new();
        let conn = Connection::new("cmd", queue(&broker), fast_options());
        conn.close();

        assert_eq!(conn.push("x").await, Err(TransportError::Closed));
        assert_eq!(broker.published(), 0);
    }
}
