//! Local client registry.
//!
//! Holds what a client must remember across restarts and never shares:
//! - its own [`ClientId`], generated once
//! - its snapshot revision counter
//! - the highest revision applied from each peer
//!
//! Persisted as a small JSON file. Every change is written to a temporary
//! file with owner-only permissions and renamed over the old one, so a crash
//! leaves either the old or the new registry, never a torn one.
//!
//! The counter lives in memory once opened, so a registry file must be owned
//! by one process at a time. The agent enforces this with a data dir lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sync_core::{PeerRevisions, SnapshotDecision};
use sync_types::{ClientId, Revision};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Filesystem failure.
    #[error("registry I/O error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Registry file cannot be parsed.
    #[error("registry file {path} is corrupt: {message}")]
    Corrupt {
        /// File involved.
        path: PathBuf,
        /// What is wrong.
        message: String,
    },

    /// `create` was asked to overwrite an existing registry.
    #[error("registry already exists at {0}")]
    AlreadyExists(PathBuf),
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    client_id: ClientId,
    revision: Revision,
    #[serde(default)]
    peers: BTreeMap<String, Revision>,
}

#[derive(Debug)]
struct RegistryState {
    revision: Revision,
    peers: PeerRevisions,
}

/// Persistent client identity and revision bookkeeping.
#[derive(Debug)]
pub struct ClientRegistry {
    client_id: ClientId,
    path: Option<PathBuf>,
    state: Mutex<RegistryState>,
}

impl ClientRegistry {
    /// A registry that lives only in memory.
    pub fn in_memory(client_id: ClientId) -> Self {
        Self {
            client_id,
            path: None,
            state: Mutex::new(RegistryState {
                revision: Revision::zero(),
                peers: PeerRevisions::new(),
            }),
        }
    }

    /// Create a new registry file with a fresh random client id.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|source| io_error(&path, source))?
        {
            return Err(RegistryError::AlreadyExists(path));
        }

        let registry = Self {
            path: Some(path),
            ..Self::in_memory(ClientId::random())
        };
        {
            let state = registry.state.lock().await;
            registry.persist(&state).await?;
        }
        debug!(client_id = %registry.client_id, "client registry created");
        Ok(registry)
    }

    /// Load an existing registry file.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| io_error(&path, source))?;
        let file: RegistryFile =
            serde_json::from_str(&contents).map_err(|e| RegistryError::Corrupt {
                path: path.clone(),
                message: e.to_string(),
            })?;

        let mut peers = PeerRevisions::new();
        for (peer, revision) in file.peers {
            let peer: ClientId = peer.parse().map_err(|e| RegistryError::Corrupt {
                path: path.clone(),
                message: format!("peer id {peer}: {e}"),
            })?;
            peers.record(peer, revision);
        }

        Ok(Self {
            client_id: file.client_id,
            path: Some(path),
            state: Mutex::new(RegistryState {
                revision: file.revision,
                peers,
            }),
        })
    }

    /// Load the registry at `path`, creating it on first run.
    pub async fn open_or_create(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        match Self::open(&path).await {
            Err(RegistryError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Self::create(path).await
            }
            other => other,
        }
    }

    /// This installation's client id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Registry file, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Last revision handed out.
    pub async fn current_revision(&self) -> Revision {
        self.state.lock().await.revision
    }

    /// Increment the revision counter and persist it before returning it.
    ///
    /// If persisting fails the counter is left unchanged.
    pub async fn next_revision(&self) -> Result<Revision, RegistryError> {
        let mut state = self.state.lock().await;
        let previous = state.revision;
        state.revision = previous.next();
        if let Err(e) = self.persist(&state).await {
            state.revision = previous;
            return Err(e);
        }
        Ok(state.revision)
    }

    /// Highest revision applied from `peer`.
    pub async fn peer_revision(&self, peer: &ClientId) -> Option<Revision> {
        self.state.lock().await.peers.get(peer)
    }

    /// Decide whether a snapshot from `sender` at `revision` should be merged.
    pub async fn classify(&self, sender: &ClientId, revision: Revision) -> SnapshotDecision {
        self.state
            .lock()
            .await
            .peers
            .classify(&self.client_id, sender, revision)
    }

    /// Record an applied snapshot. Never moves a peer backwards.
    ///
    /// Returns whether the table changed. On a persistence failure the
    /// in-memory table is rolled back too.
    pub async fn record_peer_revision(
        &self,
        peer: ClientId,
        revision: Revision,
    ) -> Result<bool, RegistryError> {
        let mut state = self.state.lock().await;
        let previous = state.peers.clone();
        if !state.peers.record(peer, revision) {
            return Ok(false);
        }
        if let Err(e) = self.persist(&state).await {
            state.peers = previous;
            return Err(e);
        }
        Ok(true)
    }

    /// All tracked peers, ordered by id.
    pub async fn peers(&self) -> Vec<(ClientId, Revision)> {
        let state = self.state.lock().await;
        let mut peers: Vec<(ClientId, Revision)> =
            state.peers.iter().map(|(p, r)| (*p, *r)).collect();
        peers.sort();
        peers
    }

    async fn persist(&self, state: &RegistryState) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = RegistryFile {
            client_id: self.client_id,
            revision: state.revision,
            peers: state
                .peers
                .iter()
                .map(|(p, r)| (p.to_string(), *r))
                .collect(),
        };
        let contents = serde_json::to_string_pretty(&file).map_err(|e| RegistryError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;

        write_private_atomic(path, contents.as_bytes())
            .await
            .map_err(|source| io_error(path, source))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `contents` to `path` via a temporary sibling and rename.
///
/// The file is owner read/write only on Unix.
pub async fn write_private_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents).await?;
    set_file_permissions_0600(&tmp).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
pub async fn set_file_permissions_0600(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
