//! Local files of an agent installation.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use sync_client::{write_private_atomic, EngineConfig, SharedSecret};

const CONFIG_FILE: &str = "queuesync.toml";

/// Where an installation keeps its state.
#[derive(Debug, Clone)]
pub struct AgentFiles {
    /// Root of all local state.
    pub data_dir: PathBuf,
    /// Hex-encoded shared secret.
    pub secret_file: PathBuf,
    /// Client registry.
    pub registry: PathBuf,
    /// Record store.
    pub store: PathBuf,
    /// Directory executed commands are written to.
    pub spool: PathBuf,
    /// Lock file held by the process that owns the data dir.
    pub lock_file: PathBuf,
}

/// Exclusive hold on a data dir, released on drop.
///
/// The registry's revision counter and the record store are kept in memory
/// by whoever opened them, so only one process may use a data dir at a time.
#[derive(Debug)]
pub struct DataDirLock {
    _file: File,
}

impl AgentFiles {
    /// Resolve paths from config, falling back to the platform data dir.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let data_dir = match &config.client.data_dir {
            Some(dir) => dir.clone(),
            None => project_dirs()?.data_dir().to_path_buf(),
        };
        Ok(Self::in_dir(data_dir, config.client.secret_file.clone()))
    }

    /// Standard layout under `data_dir`.
    pub fn in_dir(data_dir: PathBuf, secret_file: Option<PathBuf>) -> Self {
        Self {
            secret_file: secret_file.unwrap_or_else(|| data_dir.join("secret.key")),
            registry: data_dir.join("registry.json"),
            store: data_dir.join("records.json"),
            spool: data_dir.join("spool"),
            lock_file: data_dir.join("agent.lock"),
            data_dir,
        }
    }

    /// Take the data dir for this process.
    ///
    /// Fails immediately if another process holds it.
    pub fn acquire_lock(&self) -> Result<DataDirLock> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create {}", self.data_dir.display()))?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_file)
            .with_context(|| format!("Failed to open {}", self.lock_file.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(DataDirLock { _file: file }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                anyhow::bail!(
                    "Data directory {} is in use by another queuesync-agent process. \
                     Stop it first.",
                    self.data_dir.display()
                )
            }
            Err(e) => Err(e)
                .with_context(|| format!("Failed to lock {}", self.lock_file.display())),
        }
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("io", "ydun", "queuesync")
        .context("Could not determine home directory")
}

/// Load the config file, or defaults when none exists at the default location.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    if let Some(path) = path {
        return EngineConfig::from_file(path).context("Invalid configuration");
    }

    let default = project_dirs()?.config_dir().join(CONFIG_FILE);
    if default.exists() {
        EngineConfig::from_file(&default).context("Invalid configuration")
    } else {
        Ok(EngineConfig::default())
    }
}

/// Read the shared secret.
pub async fn load_secret(path: &Path) -> Result<SharedSecret> {
    let text = tokio::fs::read_to_string(path).await.with_context(|| {
        format!(
            "Shared secret not found at {}. Run 'queuesync-agent init' first.",
            path.display()
        )
    })?;
    SharedSecret::from_hex(&text).context("Invalid shared secret file")
}

/// Write the shared secret, owner read/write only.
pub async fn save_secret(path: &Path, secret: &SharedSecret) -> Result<()> {
    let mut contents = secret.to_hex();
    contents.push('\n');
    write_private_atomic(path, contents.as_bytes())
        .await
        .context("Failed to save shared secret")
}
