//! Queue transport abstraction.
//!
//! The engine talks to an at-least-once message queue through this trait.
//! A transport is bound to one purpose: it publishes to one destination and
//! reads from one inbox.
//!
//! # Design
//!
//! - `push()` publishes a text body and returns the queue's message id
//! - `poll()` long-polls the inbox for up to `max` messages
//! - `acknowledge()` deletes a received message by receipt handle
//! - `queue_depth()` reports the approximate backlog of the publish destination
//!
//! A received message stays invisible to other polls until acknowledged or
//! until the queue's visibility timeout returns it to the inbox.

mod http;
mod mock;

pub use http::{HttpQueue, HttpQueueConfig, TlsMode};
pub use mock::{MockBroker, MockOp, MockQueue};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Transport errors.
///
/// Each variant is either transient (worth retrying) or permanent; see
/// [`TransportError::is_transient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Credentials were refused.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The queue does not exist.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The request was malformed or refused.
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// HTTP-style status code.
        status: u16,
        /// Server message.
        message: String,
    },

    /// The service asked us to slow down.
    #[error("throttled: {0}")]
    Throttled(String),

    /// The service failed or is overloaded.
    #[error("service unavailable ({status}): {message}")]
    Unavailable {
        /// HTTP-style status code.
        status: u16,
        /// Server message.
        message: String,
    },

    /// Network-level failure (DNS, connect, reset).
    #[error("network error: {0}")]
    Network(String),

    /// The call did not complete in time.
    #[error("timed out")]
    Timeout,

    /// The service answered with something we could not parse.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The transport could not be built from its configuration.
    #[error("invalid transport configuration: {0}")]
    Config(String),

    /// The connection has been shut down.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Throttled(_)
                | TransportError::Unavailable { .. }
                | TransportError::Network(_)
                | TransportError::Timeout
        )
    }
}

/// One message received from an inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Text body as pushed.
    pub body: String,
    /// Handle used to acknowledge this delivery.
    pub receipt: String,
}

/// Approximate message counts for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Messages waiting to be received.
    pub available: u64,
    /// Messages received but not yet acknowledged.
    pub in_flight: u64,
}

impl QueueDepth {
    /// Available plus in-flight.
    pub fn total(&self) -> u64 {
        self.available.saturating_add(self.in_flight)
    }
}

/// Queue transport for pushing and pulling envelope bodies.
///
/// Implementations are shared across tasks and must be `Send + Sync`.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Cheap call proving the inbox exists and credentials work.
    async fn health_check(&self) -> Result<(), TransportError>;

    /// Publish a body. Returns the queue-assigned message id.
    async fn push(&self, body: &str) -> Result<String, TransportError>;

    /// Receive up to `max_messages`, waiting up to `wait` if none are ready.
    async fn poll(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, TransportError>;

    /// Delete a received message.
    async fn acknowledge(&self, receipt: &str) -> Result<(), TransportError>;

    /// Approximate backlog of the publish destination.
    async fn queue_depth(&self) -> Result<QueueDepth, TransportError>;
}

#[async_trait]
impl<T: QueueTransport + ?Sized> QueueTransport for Box<T> {
    async fn health_check(&self) -> Result<(), TransportError> {
        (**self).health_check().await
    }

    async fn push(&self, body: &str) -> Result<String, TransportError> {
        (**self).push(body).await
    }

    async fn poll(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, TransportError> {
        (**self).poll(max_messages, wait).await
    }

    async fn acknowledge(&self, receipt: &str) -> Result<(), TransportError> {
        (**self).acknowledge(receipt).await
    }

    async fn queue_depth(&self) -> Result<QueueDepth, TransportError> {
        (**self).queue_depth().await
    }
}
