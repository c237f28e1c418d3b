//! Run the relay and sync loops until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use sync_client::{
    ClientRegistry, Connection, EngineConfig, EnvelopeCodec, MockBroker, Node, QueueTransport,
    SharedStore,
};
use tracing::info;

use super::{codec, connect_queue, mock_queue};
use crate::executor::SpoolExecutor;
use crate::files::{load_secret, AgentFiles};
use crate::store::JsonFileStore;

/// Run the run command.
pub async fn run(config: &EngineConfig, files: &AgentFiles, use_mock: bool) -> Result<()> {
    // Held until the loops have shut down
    let _lock = files.acquire_lock()?;
    let secret = load_secret(&files.secret_file).await?;
    let codec = codec(config, &secret)?;
    let registry = ClientRegistry::open(&files.registry)
        .await
        .context("Client not initialized. Run 'queuesync-agent init' first.")?;
    let registry = Arc::new(registry);

    if use_mock {
        let broker = MockBroker::new();
        let command = mock_queue(&broker, config, &config.queues.command, "command").await?;
        let sync = mock_queue(&broker, config, &config.queues.sync, "sync").await?;
        serve(config, files, command, sync, codec, registry).await
    } else {
        let command = connect_queue(config, &config.queues.command, "command").await?;
        let sync = connect_queue(config, &config.queues.sync, "sync").await?;
        serve(config, files, command, sync, codec, registry).await
    }
}

async fn serve<T: QueueTransport + 'static>(
    config: &EngineConfig,
    files: &AgentFiles,
    command: Connection<T>,
    sync: Connection<T>,
    codec: EnvelopeCodec,
    registry: Arc<ClientRegistry>,
) -> Result<()> {
    let client_id = registry.client_id();
    let node = Node::new(
        command,
        sync,
        codec,
        registry,
        SharedStore::new(JsonFileStore::new(&files.store)),
        Arc::new(SpoolExecutor::new(&files.spool)),
        config.node_settings(),
    );

    let handle = node.start();
    info!(%client_id, spool = %files.spool.display(), "agent running, Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
