//! Engine configuration.
//!
//! Loaded from a TOML file (default: `queuesync.toml` in the platform config
//! directory). Every section and field is optional.
//!
//! ```toml
//! [transport]
//! endpoint = "https://queues.example.net"
//! token_env = "QUEUESYNC_TOKEN"
//!
//! [transport.tls]
//! verify = "strict"          # or "insecure-skip-verify"
//!
//! [queues.command]
//! inbox = "print-commands-site-a"
//! publish = "print-commands"
//!
//! [queues.sync]
//! inbox = "state-site-a"
//! publish = "state"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sync_core::{RetryPolicy, ThrottlePolicy};

use crate::connection::ConnectionOptions;
use crate::credentials::{
    CredentialChain, EnvProvider, ExplicitProvider, ProfileFileProvider, DEFAULT_PROFILE,
    DEFAULT_TOKEN_ENV,
};
use crate::inbox::PollSettings;
use crate::node::NodeSettings;
use crate::transport::{HttpQueueConfig, TlsMode};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local files.
    pub client: ClientConfig,
    /// Queue service connection.
    pub transport: TransportConfig,
    /// Queue names per purpose.
    pub queues: QueuesConfig,
    /// Inbox polling.
    pub poll: PollConfig,
    /// Retry of transient transport errors.
    pub retry: RetryConfig,
    /// Producer throttling.
    pub backpressure: BackpressureConfig,
    /// Envelope policy.
    pub security: SecurityConfig,
    /// Snapshot pushing and command delivery.
    pub sync: SyncConfig,
}

/// Local file locations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory for the registry, store and spool (default: platform data dir).
    pub data_dir: Option<PathBuf>,
    /// Hex-encoded shared secret file (default: `<data_dir>/secret.key`).
    pub secret_file: Option<PathBuf>,
}

/// Queue service connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL of the queue service.
    pub endpoint: String,
    /// Token given directly in the config. Prefer `token_env`.
    pub token: Option<String>,
    /// Environment variable holding the token (default: `QUEUESYNC_TOKEN`).
    pub token_env: String,
    /// Profile in the ambient credentials file (default: `default`).
    pub profile: String,
    /// Ambient credentials file (default: platform config dir).
    pub credentials_file: Option<PathBuf>,
    /// TLS settings.
    pub tls: TlsConfig,
    /// HTTP request timeout in seconds (default: 10).
    pub request_timeout_secs: u64,
    /// Timeout per call attempt in seconds, polls get their wait on top (default: 15).
    pub call_timeout_secs: u64,
    /// Consecutive failed calls before an operator alert (default: 3).
    pub alert_after_failures: u32,
}

/// TLS settings.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Certificate verification (default: strict).
    pub verify: TlsMode,
}

/// Queue names per purpose.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    /// Command queue.
    pub command: QueuePair,
    /// State snapshot queue.
    pub sync: QueuePair,
}

/// The inbox a client reads and the destination it publishes to.
#[derive(Debug, Clone, Deserialize)]
pub struct QueuePair {
    /// Queue this client reads.
    pub inbox: String,
    /// Destination to publish to (default: the inbox).
    #[serde(default)]
    pub publish: Option<String>,
}

impl QueuePair {
    fn named(inbox: &str) -> Self {
        Self {
            inbox: inbox.to_string(),
            publish: None,
        }
    }

    /// Destination messages are published to.
    pub fn publish(&self) -> &str {
        self.publish.as_deref().unwrap_or(&self.inbox)
    }
}

/// Inbox polling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Messages per poll (default: 10).
    pub batch_size: u32,
    /// Long-poll wait in seconds (default: 20).
    pub wait_secs: u64,
    /// Pause after a failed poll in seconds (default: 5).
    pub error_backoff_secs: u64,
}

/// Retry of transient transport errors.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first (default: 5).
    pub max_attempts: u32,
    /// First backoff delay in milliseconds (default: 200).
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds (default: 10000).
    pub max_delay_ms: u64,
    /// Random jitter bound in milliseconds (default: 250).
    pub jitter_ms: u64,
}

/// Producer throttling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Backlog above which producers defer (default: 1000).
    pub threshold: u64,
    /// Seconds between re-checks (default: 5).
    pub defer_secs: u64,
    /// Deferrals before giving up (default: 3).
    pub max_deferrals: u32,
}

/// Envelope policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Reject anything that is not an authenticated encrypted envelope (default: true).
    pub encryption_required: bool,
}

/// Snapshot pushing and command delivery.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Periodic snapshot push in seconds (default: 60).
    pub push_interval_secs: u64,
    /// Execute commands this client sent itself (default: false).
    pub deliver_own_commands: bool,
}

// Default value functions
fn default_endpoint() -> String {
    "http://localhost:9324".to_string()
}

fn default_command_inbox() -> String {
    "queuesync-command".to_string()
}

fn default_sync_inbox() -> String {
    "queuesync-sync".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            token: None,
            token_env: DEFAULT_TOKEN_ENV.to_string(),
            profile: DEFAULT_PROFILE.to_string(),
            credentials_file: None,
            tls: TlsConfig::default(),
            request_timeout_secs: 10,
            call_timeout_secs: 15,
            alert_after_failures: 3,
        }
    }
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            command: QueuePair::named(&default_command_inbox()),
            sync: QueuePair::named(&default_sync_inbox()),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        let defaults = PollSettings::default();
        Self {
            batch_size: defaults.batch_size,
            wait_secs: defaults.wait.as_secs(),
            error_backoff_secs: defaults.error_backoff.as_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            jitter_ms: defaults.jitter.as_millis() as u64,
        }
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        let defaults = ThrottlePolicy::default();
        Self {
            threshold: defaults.threshold,
            defer_secs: defaults.defer.as_secs(),
            max_deferrals: defaults.max_deferrals,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption_required: true,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_interval_secs: 60,
            deliver_own_commands: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Retry, timeout and alerting knobs for queue connections.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter: Duration::from_millis(self.retry.jitter_ms),
            },
            call_timeout: Duration::from_secs(self.transport.call_timeout_secs),
            alert_after: self.transport.alert_after_failures,
        }
    }

    /// Backpressure policy.
    pub fn throttle_policy(&self) -> ThrottlePolicy {
        ThrottlePolicy {
            threshold: self.backpressure.threshold,
            defer: Duration::from_secs(self.backpressure.defer_secs),
            max_deferrals: self.backpressure.max_deferrals,
        }
    }

    /// Inbox polling settings.
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            batch_size: self.poll.batch_size,
            wait: Duration::from_secs(self.poll.wait_secs),
            error_backoff: Duration::from_secs(self.poll.error_backoff_secs),
        }
    }

    /// Periodic snapshot push interval.
    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.sync.push_interval_secs.max(1))
    }

    /// Loop and policy settings for a [`Node`](crate::node::Node).
    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            poll: self.poll_settings(),
            throttle: self.throttle_policy(),
            push_interval: self.push_interval(),
            deliver_own_commands: self.sync.deliver_own_commands,
        }
    }

    /// HTTP transport settings for one queue pair.
    pub fn http_queue(&self, queues: &QueuePair) -> HttpQueueConfig {
        HttpQueueConfig {
            endpoint: self.transport.endpoint.clone(),
            publish: queues.publish().to_string(),
            inbox: queues.inbox.clone(),
            tls: self.transport.tls.verify,
            request_timeout: Duration::from_secs(self.transport.request_timeout_secs),
        }
    }

    /// Credential providers in resolution order.
    pub fn credential_chain(&self) -> CredentialChain {
        let transport = &self.transport;
        match &transport.credentials_file {
            Some(path) => CredentialChain::new()
                .with(ExplicitProvider::new(transport.token.clone()))
                .with(EnvProvider::new(transport.token_env.clone()))
                .with(ProfileFileProvider::new(path.clone(), transport.profile.clone())),
            None => CredentialChain::standard(
                transport.token.clone(),
                &transport.token_env,
                &transport.profile,
            ),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
