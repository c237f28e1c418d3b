//! Inbox pull loop.
//!
//! Polls one inbox, opens each envelope and routes it by message type:
//! commands to the [`CommandRelay`], snapshots to the [`SyncEngine`].
//!
//! A message is acknowledged once it has been fully dealt with, which
//! includes being rejected. The only messages left in the queue are snapshots
//! whose merge did not complete; the queue redelivers them.

use std::sync::Arc;
use std::time::Duration;

use sync_types::MessageType;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::codec::EnvelopeCodec;
use crate::connection::Connection;
use crate::engine::{SnapshotOutcome, SyncEngine};
use crate::relay::{CommandOutcome, CommandRelay};
use crate::transport::{QueueMessage, QueueTransport, TransportError};

/// Poll batch and timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Messages requested per poll.
    pub batch_size: u32,
    /// Long-poll wait.
    pub wait: Duration,
    /// Pause after a failed poll before trying again.
    pub error_backoff: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            wait: Duration::from_secs(20),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// What happened to one received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Routed to the command relay.
    Command(CommandOutcome),
    /// Routed to the sync engine.
    Snapshot(SnapshotOutcome),
    /// Failed to open; discarded.
    Rejected(String),
    /// Processing did not complete; left for redelivery.
    Retained(String),
}

impl Disposition {
    /// Whether the message should be deleted from the queue.
    pub fn should_acknowledge(&self) -> bool {
        !matches!(self, Disposition::Retained(_))
    }
}

/// One polled inbox and its routing.
pub struct Inbox<T, R = T> {
    connection: Arc<Connection<T>>,
    codec: EnvelopeCodec,
    relay: Arc<CommandRelay<R>>,
    engine: Arc<SyncEngine<R>>,
    settings: PollSettings,
}

impl<T: QueueTransport, R: QueueTransport> Inbox<T, R> {
    /// Create an inbox reader.
    pub fn new(
        connection: Arc<Connection<T>>,
        codec: EnvelopeCodec,
        relay: Arc<CommandRelay<R>>,
        engine: Arc<SyncEngine<R>>,
        settings: PollSettings,
    ) -> Self {
        Self {
            connection,
            codec,
            relay,
            engine,
            settings,
        }
    }

    /// Inbox name used in logs.
    pub fn name(&self) -> &str {
        self.connection.name()
    }

    /// Poll once and process the batch.
    ///
    /// Stops processing (without acknowledging) the rest of the batch once
    /// shutdown is signalled.
    pub async fn pull_once(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Vec<Disposition>, TransportError> {
        let messages = self.poll().await?;
        Ok(self.handle_batch(messages, shutdown).await)
    }

    async fn poll(&self) -> Result<Vec<QueueMessage>, TransportError> {
        self.connection
            .poll(self.settings.batch_size, self.settings.wait)
            .await
    }

    /// Process a polled batch in order.
    ///
    /// The message being processed always runs to completion; shutdown is
    /// only checked between messages.
    async fn handle_batch(
        &self,
        messages: Vec<QueueMessage>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<Disposition> {
        let mut dispositions = Vec::with_capacity(messages.len());
        for message in messages {
            if *shutdown.borrow() {
                debug!(inbox = %self.name(), "shutdown requested, leaving rest of batch");
                break;
            }

            let disposition = self.process(&message.body).await;
            if disposition.should_acknowledge() {
                if let Err(error) = self.connection.acknowledge(&message.receipt).await {
                    // The queue will redeliver; every handler tolerates that.
                    warn!(inbox = %self.name(), %error, "acknowledge failed");
                }
            }
            dispositions.push(disposition);
        }
        dispositions
    }

    /// Open and route one message body.
    pub async fn process(&self, body: &str) -> Disposition {
        let opened = match self.codec.open_body(body) {
            Ok(opened) => opened,
            Err(e) if e.is_security_relevant() => {
                error!(
                    inbox = %self.name(),
                    error = %e,
                    "SECURITY: rejected message that failed authentication"
                );
                return Disposition::Rejected(e.to_string());
            }
            Err(e) => {
                warn!(inbox = %self.name(), error = %e, "discarding unreadable message");
                return Disposition::Rejected(e.to_string());
            }
        };

        match opened.message_type {
            MessageType::Command => Disposition::Command(self.relay.on_command(&opened).await),
            MessageType::StateSnapshot => match self.engine.on_snapshot(&opened).await {
                Ok(outcome) => Disposition::Snapshot(outcome),
                Err(e) => {
                    warn!(
                        inbox = %self.name(),
                        message_id = %opened.message_id,
                        error = %e,
                        "snapshot merge failed, leaving for redelivery"
                    );
                    Disposition::Retained(e.to_string())
                }
            },
        }
    }

    /// Poll until shutdown.
    ///
    /// Poll failures are logged and retried after `error_backoff`; the loop
    /// never ends on its own. Shutdown interrupts a long-poll wait but never
    /// a message being processed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(inbox = %self.name(), "inbox loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                polled = self.poll() => polled,
                _ = shutdown.changed() => break,
            };

            match polled {
                Ok(messages) => {
                    self.handle_batch(messages, &shutdown).await;
                }
                Err(error) => {
                    warn!(inbox = %self.name(), %error, "poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.error_backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        info!(inbox = %self.name(), "inbox loop stopped");
    }
}

impl<T, R> std::fmt::Debug for Inbox<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
