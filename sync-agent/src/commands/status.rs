//! Show identity, peer revisions and queue depths.

use anyhow::Result;
use sync_client::{ClientRegistry, Connection, EngineConfig, MockBroker, QueueTransport};

use super::{connect_queue, mock_queue};
use crate::files::AgentFiles;
use crate::store::JsonFileStore;

/// Run the status command.
pub async fn run(config: &EngineConfig, files: &AgentFiles, use_mock: bool) -> Result<()> {
    println!("=== queuesync-agent status ===");
    println!();

    // Check identity
    let registry = match ClientRegistry::open(&files.registry).await {
        Ok(registry) => registry,
        Err(_) => {
            println!("Client: NOT INITIALIZED");
            println!();
            println!("Run 'queuesync-agent init' to initialize.");
            return Ok(());
        }
    };

    println!("Client:");
    println!("  ID:       {}", registry.client_id());
    println!("  Revision: {}", registry.current_revision().await);
    println!("  Store:    {}", JsonFileStore::new(&files.store).path().display());
    println!(
        "  Secret:   {}",
        if files.secret_file.exists() { "present" } else { "MISSING" }
    );
    println!();

    let peers = registry.peers().await;
    println!("Peers: {} known", peers.len());
    for (peer, revision) in &peers {
        println!("  {} (revision {})", peer, revision);
    }
    println!();

    println!("Queues:");
    let queues = [("command", &config.queues.command), ("sync", &config.queues.sync)];
    if use_mock {
        let broker = MockBroker::new();
        for (name, pair) in queues {
            match mock_queue(&broker, config, pair, name).await {
                Ok(connection) => print_depth(config, name, &connection).await,
                Err(e) => println!("  {name}: UNREACHABLE ({e:#})"),
            }
        }
    } else {
        for (name, pair) in queues {
            match connect_queue(config, pair, name).await {
                Ok(connection) => print_depth(config, name, &connection).await,
                Err(e) => println!("  {name}: UNREACHABLE ({e:#})"),
            }
        }
    }

    Ok(())
}

async fn print_depth<T: QueueTransport>(
    config: &EngineConfig,
    name: &str,
    connection: &Connection<T>,
) {
    match connection.queue_depth_detail().await {
        Ok(depth) => {
            let marker = if depth.total() > config.backpressure.threshold {
                " BACKLOGGED"
            } else {
                ""
            };
            println!(
                "  {name}: {} waiting, {} in flight (threshold {}){marker}",
                depth.available, depth.in_flight, config.backpressure.threshold
            );
        }
        Err(e) => println!("  {name}: depth unavailable ({e})"),
    }
}
