//! Node runner: wires the relay, engine and inbox loops together and runs
//! them as background tasks until shutdown.
//!
//! Three tasks run per node:
//! - command inbox pull loop
//! - sync inbox pull loop
//! - snapshot push loop
//!
//! They share only the gated record store and the registry.

use std::sync::Arc;
use std::time::Duration;

use sync_core::ThrottlePolicy;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backpressure::BackpressureMonitor;
use crate::codec::EnvelopeCodec;
use crate::connection::Connection;
use crate::engine::{SyncEngine, DEFAULT_PUSH_INTERVAL};
use crate::inbox::{Inbox, PollSettings};
use crate::registry::ClientRegistry;
use crate::relay::{CommandExecutor, CommandRelay};
use crate::store::SharedStore;
use crate::transport::QueueTransport;

/// Loop and policy settings for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSettings {
    /// Inbox polling.
    pub poll: PollSettings,
    /// Producer throttling.
    pub throttle: ThrottlePolicy,
    /// Periodic snapshot push.
    pub push_interval: Duration,
    /// Execute commands this client sent itself.
    pub deliver_own_commands: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            poll: PollSettings::default(),
            throttle: ThrottlePolicy::default(),
            push_interval: DEFAULT_PUSH_INTERVAL,
            deliver_own_commands: false,
        }
    }
}

/// A fully wired client, not yet running.
pub struct Node<T> {
    relay: Arc<CommandRelay<T>>,
    engine: Arc<SyncEngine<T>>,
    command_inbox: Inbox<T>,
    sync_inbox: Inbox<T>,
    push_interval: Duration,
}

impl<T: QueueTransport + 'static> Node<T> {
    /// Wire a node from its two queue connections and collaborators.
    pub fn new(
        command: Connection<T>,
        sync: Connection<T>,
        codec: EnvelopeCodec,
        registry: Arc<ClientRegistry>,
        store: SharedStore,
        executor: Arc<dyn CommandExecutor>,
        settings: NodeSettings,
    ) -> Self {
        let command = Arc::new(command);
        let sync = Arc::new(sync);
        let backpressure = BackpressureMonitor::new(settings.throttle);

        let relay = Arc::new(
            CommandRelay::new(
                command.clone(),
                codec.clone(),
                registry.client_id(),
                backpressure,
                executor,
            )
            .with_deliver_own_commands(settings.deliver_own_commands),
        );
        let engine = Arc::new(SyncEngine::new(
            sync.clone(),
            codec.clone(),
            registry,
            store,
            backpressure,
        ));

        let command_inbox = Inbox::new(
            command,
            codec.clone(),
            relay.clone(),
            engine.clone(),
            settings.poll,
        );
        let sync_inbox = Inbox::new(sync, codec, relay.clone(), engine.clone(), settings.poll);

        Self {
            relay,
            engine,
            command_inbox,
            sync_inbox,
            push_interval: settings.push_interval,
        }
    }

    /// The command relay.
    pub fn relay(&self) -> &Arc<CommandRelay<T>> {
        &self.relay
    }

    /// The sync engine.
    pub fn engine(&self) -> &Arc<SyncEngine<T>> {
        &self.engine
    }

    /// Spawn the node's loops.
    pub fn start(self) -> NodeHandle<T> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(client_id = %self.engine.client_id(), "node starting");

        let command_inbox = self.command_inbox;
        let rx = shutdown_rx.clone();
        let command_task = tokio::spawn(async move { command_inbox.run(rx).await });

        let sync_inbox = self.sync_inbox;
        let rx = shutdown_rx.clone();
        let sync_task = tokio::spawn(async move { sync_inbox.run(rx).await });

        let engine = self.engine.clone();
        let interval = self.push_interval;
        let push_task =
            tokio::spawn(async move { engine.run_push_loop(interval, shutdown_rx).await });

        NodeHandle {
            relay: self.relay,
            engine: self.engine,
            shutdown: shutdown_tx,
            tasks: vec![command_task, sync_task, push_task],
        }
    }
}

impl<T> std::fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("push_interval", &self.push_interval)
            .finish_non_exhaustive()
    }
}

/// A running node.
pub struct NodeHandle<T> {
    relay: Arc<CommandRelay<T>>,
    engine: Arc<SyncEngine<T>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: QueueTransport + 'static> NodeHandle<T> {
    /// The command relay, for sending commands.
    pub fn relay(&self) -> &Arc<CommandRelay<T>> {
        &self.relay
    }

    /// The sync engine, for local mutations.
    pub fn engine(&self) -> &Arc<SyncEngine<T>> {
        &self.engine
    }

    /// Ask the push loop to push soon.
    pub fn trigger_push(&self) {
        self.engine.trigger_push();
    }

    /// Stop all loops and close both connections.
    ///
    /// Waits for in-flight calls to finish or time out.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "node task ended abnormally");
            }
        }
        self.relay.connection().close();
        self.engine.connection().close();
        info!(client_id = %self.engine.client_id(), "node stopped");
    }
}

impl<T> std::fmt::Debug for NodeHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}
