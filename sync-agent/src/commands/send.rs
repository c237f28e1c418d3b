//! Send one command.

use anyhow::{Context, Result};
use std::sync::Arc;
use sync_client::{
    BackpressureMonitor, ClientRegistry, Command, CommandRelay, Connection, EngineConfig,
    EnvelopeCodec, MessageId, MockBroker, QueueTransport, RecordingExecutor,
};

use super::{codec, connect_queue, mock_queue};
use crate::files::{load_secret, AgentFiles};

/// Run the send command.
pub async fn run(
    config: &EngineConfig,
    files: &AgentFiles,
    kind: &str,
    args: Vec<u8>,
    use_mock: bool,
) -> Result<()> {
    let secret = load_secret(&files.secret_file).await?;
    let codec = codec(config, &secret)?;
    let registry = ClientRegistry::open(&files.registry)
        .await
        .context("Client not initialized. Run 'queuesync-agent init' first.")?;
    let command = Command::new(kind, args);

    println!("Sending {} command ({} bytes)...", kind, command.args.len());

    let message_id = if use_mock {
        let broker = MockBroker::new();
        let connection = mock_queue(&broker, config, &config.queues.command, "command").await?;
        do_send(config, connection, codec, &registry, &command).await?
    } else {
        let connection = connect_queue(config, &config.queues.command, "command").await?;
        do_send(config, connection, codec, &registry, &command).await?
    };

    println!("Sent.");
    println!("  Message ID: {}", message_id);
    Ok(())
}

/// Push one command through a relay on `connection`.
pub async fn do_send<T: QueueTransport>(
    config: &EngineConfig,
    connection: Connection<T>,
    codec: EnvelopeCodec,
    registry: &ClientRegistry,
    command: &Command,
) -> Result<MessageId> {
    // The sending side never executes anything
    let relay = CommandRelay::new(
        Arc::new(connection),
        codec,
        registry.client_id(),
        BackpressureMonitor::new(config.throttle_policy()),
        Arc::new(RecordingExecutor::new()),
    );
    relay
        .send_command(command)
        .await
        .context("Command was not delivered")
}
