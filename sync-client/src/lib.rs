//! # sync-client
//!
//! Encrypted command relay and state synchronization over an at-least-once
//! message queue.
//!
//! Clients never talk to each other directly. Each one owns a private inbox
//! per purpose (commands, state) and publishes to a destination that fans out
//! to every inbox, so the queue is the only shared infrastructure and it only
//! ever sees ciphertext.
//!
//! ## Features
//!
//! - **E2E Encryption**: XChaCha20-Poly1305 with 192-bit nonces, header bound as AAD
//! - **Convergent State**: full snapshots merged last-writer-wins, order independent
//! - **Exactly-once Effects**: de-duplication by message id and per-peer revision
//! - **Graceful Degradation**: retry with backoff, backpressure, link health alerts
//! - **Transport Abstraction**: pluggable queue transport (HTTP, in-memory mock)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sync_client::*;
//!
//! let config = EngineConfig::from_file(path)?;
//! let options = config.connection_options();
//! let chain = config.credential_chain();
//! let command = connect_http("command", config.http_queue(&config.queues.command), &chain, options).await?;
//! let sync = connect_http("sync", config.http_queue(&config.queues.sync), &chain, options).await?;
//!
//! let node = Node::new(command, sync, codec, registry, store, executor, config.node_settings());
//! let handle = node.start();
//! handle.relay().send_command(&Command::new("print", args)).await?;
//! handle.shutdown().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backpressure;
pub mod codec;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod crypto;
pub mod engine;
pub mod inbox;
pub mod node;
pub mod registry;
pub mod relay;
pub mod store;
pub mod transport;

pub use backpressure::{Admission, BackpressureMonitor};
pub use codec::{CodecError, EnvelopeCodec, Opened};
pub use config::{ConfigError, EngineConfig, QueuePair};
pub use connection::{connect_http, ConnectError, Connection, ConnectionOptions};
pub use credentials::{
    CredentialChain, CredentialError, CredentialProvider, Credentials, EnvProvider,
    ExplicitProvider, ProfileFileProvider, DEFAULT_PROFILE, DEFAULT_TOKEN_ENV,
};
pub use crypto::{CryptoError, EnvelopeKey, SharedSecret, KEY_SIZE};
pub use engine::{EngineError, PushOutcome, SnapshotOutcome, SyncEngine, DEFAULT_PUSH_INTERVAL};
pub use inbox::{Disposition, Inbox, PollSettings};
pub use node::{Node, NodeHandle, NodeSettings};
pub use registry::{ClientRegistry, RegistryError};
pub use relay::{
    CommandExecutor, CommandOutcome, CommandRelay, RecordingExecutor, RelayError,
    DEFAULT_SEEN_WINDOW,
};
pub use store::{MemoryStore, RecordStore, SharedStore, StoreError, StoreGuard};
pub use transport::{
    HttpQueue, HttpQueueConfig, MockBroker, MockOp, MockQueue, QueueDepth, QueueMessage,
    QueueTransport, TlsMode, TransportError,
};

pub use sync_core::{MergeStats, RetryPolicy, ThrottlePolicy};
pub use sync_types::{
    ClientId, Command, MessageId, MessageType, Record, Revision, Snapshot, MAX_UPDATED_AT,
};

pub use registry::{set_file_permissions_0600, write_private_atomic};
