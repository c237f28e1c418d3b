//! Agent command implementations.

pub mod init;
pub mod run;
pub mod send;
pub mod status;
pub mod touch;

use anyhow::{Context, Result};
use sync_client::{
    connect_http, Connection, EngineConfig, EnvelopeCodec, EnvelopeKey, HttpQueue, MockBroker,
    MockQueue, QueuePair, SharedSecret,
};

/// Codec for the deployment secret under the configured policy.
pub fn codec(config: &EngineConfig, secret: &SharedSecret) -> Result<EnvelopeCodec> {
    EnvelopeCodec::new(
        Some(EnvelopeKey::derive(secret)),
        config.security.encryption_required,
    )
    .context("Invalid envelope settings")
}

/// Connect to one configured queue pair over HTTP.
pub async fn connect_queue(
    config: &EngineConfig,
    queues: &QueuePair,
    name: &str,
) -> Result<Connection<HttpQueue>> {
    connect_http(
        name,
        config.http_queue(queues),
        &config.credential_chain(),
        config.connection_options(),
    )
    .await
    .with_context(|| format!("Failed to connect to {name} queue {}", queues.inbox))
}

/// Connect to one queue pair on an in-memory broker.
pub async fn mock_queue(
    broker: &MockBroker,
    config: &EngineConfig,
    queues: &QueuePair,
    name: &str,
) -> Result<Connection<MockQueue>> {
    let transport = broker.subscribe(queues.publish(), &queues.inbox);
    Connection::connect(name, transport, config.connection_options())
        .await
        .with_context(|| format!("Failed to connect to {name} queue {}", queues.inbox))
}
