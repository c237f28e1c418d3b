//! Command relay.
//!
//! Sending side: serialize a [`Command`], seal it into a `COMMAND` envelope
//! and push it, after asking the backpressure monitor. A failed send is
//! reported to the caller; commands are never queued locally for later.
//!
//! Receiving side: hand each decrypted command to the external
//! [`CommandExecutor`] exactly once per process lifetime. Redeliveries are
//! recognised by message id. The executor's outcome is logged, never retried.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sync_core::SeenMessages;
use sync_types::{ClientId, Command, MessageId, MessageType, SyncError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backpressure::{Admission, BackpressureMonitor};
use crate::codec::{CodecError, EnvelopeCodec, Opened};
use crate::connection::Connection;
use crate::transport::{QueueTransport, TransportError};

/// Default number of recent command ids remembered for de-duplication.
pub const DEFAULT_SEEN_WINDOW: usize = 1024;

/// Errors sending a command.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Command could not be serialized.
    #[error("cannot encode command: {0}")]
    Encode(#[from] SyncError),

    /// Command could not be sealed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Queue unreachable after retries, or a permanent queue error.
    #[error("command not delivered: {0}")]
    Undelivered(#[from] TransportError),

    /// Queue stayed over the backpressure threshold.
    #[error("command not delivered: queue backlog {depth} over threshold")]
    Backpressure {
        /// Last observed depth.
        depth: u64,
    },
}

/// External collaborator that carries out commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command. An error is logged by the relay, not retried.
    async fn execute(&self, command: Command) -> Result<(), String>;
}

/// What the relay did with an incoming command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Handed to the executor, which succeeded.
    Executed,
    /// Handed to the executor, which failed.
    ExecutorFailed(String),
    /// Seen before; dropped.
    Duplicate,
    /// Our own command echoed back; dropped.
    OwnCommand,
    /// Payload did not decode as a command.
    Malformed(String),
}

/// Builds, sends and dispatches commands.
pub struct CommandRelay<T> {
    connection: Arc<Connection<T>>,
    codec: EnvelopeCodec,
    client_id: ClientId,
    backpressure: BackpressureMonitor,
    executor: Arc<dyn CommandExecutor>,
    seen: Mutex<SeenMessages>,
    deliver_own_commands: bool,
}

impl<T: QueueTransport> CommandRelay<T> {
    /// Create a relay pushing through `connection`.
    pub fn new(
        connection: Arc<Connection<T>>,
        codec: EnvelopeCodec,
        client_id: ClientId,
        backpressure: BackpressureMonitor,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            connection,
            codec,
            client_id,
            backpressure,
            executor,
            seen: Mutex::new(SeenMessages::new(DEFAULT_SEEN_WINDOW)),
            deliver_own_commands: false,
        }
    }

    /// Also execute commands this client sent itself.
    pub fn with_deliver_own_commands(mut self, deliver: bool) -> Self {
        self.deliver_own_commands = deliver;
        self
    }

    /// Remember up to `window` recent command ids.
    pub fn with_seen_window(mut self, window: usize) -> Self {
        self.seen = Mutex::new(SeenMessages::new(window));
        self
    }

    /// Send a command. Returns its message id once the queue accepted it.
    pub async fn send_command(&self, command: &Command) -> Result<MessageId, RelayError> {
        if let Admission::Saturated { depth } =
            self.backpressure.wait_for_capacity(&self.connection).await
        {
            return Err(RelayError::Backpressure { depth });
        }

        let plaintext = command.to_bytes()?;
        let (message_id, body) =
            self.codec
                .seal_body(MessageType::Command, self.client_id, &plaintext)?;
        self.connection.push(&body).await?;

        info!(%message_id, kind = %command.kind, "command sent");
        Ok(message_id)
    }

    /// Dispatch a decrypted `COMMAND` envelope to the executor.
    pub async fn on_command(&self, opened: &Opened) -> CommandOutcome {
        if opened.sender_id == self.client_id && !self.deliver_own_commands {
            debug!(message_id = %opened.message_id, "own command echoed back, dropping");
            return CommandOutcome::OwnCommand;
        }

        if !self.lock_seen().insert(opened.message_id) {
            debug!(message_id = %opened.message_id, "duplicate command, dropping");
            return CommandOutcome::Duplicate;
        }

        let command = match Command::from_bytes(&opened.plaintext) {
            Ok(command) => command,
            Err(e) => {
                warn!(
                    message_id = %opened.message_id,
                    sender = %opened.sender_id,
                    error = %e,
                    "undecodable command payload, discarding"
                );
                return CommandOutcome::Malformed(e.to_string());
            }
        };

        let kind = command.kind.clone();
        match self.executor.execute(command).await {
            Ok(()) => {
                info!(message_id = %opened.message_id, %kind, "command executed");
                CommandOutcome::Executed
            }
            Err(error) => {
                warn!(message_id = %opened.message_id, %kind, %error, "command execution failed");
                CommandOutcome::ExecutorFailed(error)
            }
        }
    }

    /// The connection commands are pushed through.
    pub fn connection(&self) -> &Arc<Connection<T>> {
        &self.connection
    }

    fn lock_seen(&self) -> MutexGuard<'_, SeenMessages> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> std::fmt::Debug for CommandRelay<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRelay")
            .field("client_id", &self.client_id)
            .field("deliver_own_commands", &self.deliver_own_commands)
            .finish_non_exhaustive()
    }
}

/// Executor that records commands, for tests and `--mock` runs.
///
/// Cloning shares the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingExecutor {
    inner: Arc<Mutex<RecordingInner>>,
}

#[derive(Debug, Default)]
struct RecordingInner {
    executed: Vec<Command>,
    fail_next: Option<String>,
}

impl RecordingExecutor {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecordingInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Commands executed so far, in order.
    pub fn executed(&self) -> Vec<Command> {
        self.lock().executed.clone()
    }

    /// Cause the next `execute()` to fail with the given error.
    pub fn fail_next(&self, error: &str) {
        self.lock().fail_next = Some(error.to_string());
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, command: Command) -> Result<(), String> {
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next.take() {
            return Err(error);
        }
        inner.executed.push(command);
        Ok(())
    }
}
