//! Spool-directory command executor.
//!
//! Each executed command becomes one file in the spool directory, named
//! `<unix millis>-<kind>-<id>.cmd` and holding the raw arguments. A device
//! driver (printer daemon, label renderer) picks files up from there.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use sync_client::{Command, CommandExecutor, MessageId};
use tracing::debug;

/// Writes commands into a spool directory.
#[derive(Debug, Clone)]
pub struct SpoolExecutor {
    dir: PathBuf,
}

impl SpoolExecutor {
    /// Executor writing into `dir` (created on first use).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Keep file names portable whatever the command kind says.
fn sanitize(kind: &str) -> String {
    let cleaned: String = kind
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "command".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl CommandExecutor for SpoolExecutor {
    async fn execute(&self, command: Command) -> Result<(), String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| format!("cannot create spool {}: {e}", self.dir.display()))?;

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let name = format!("{millis}-{}-{}.cmd", sanitize(&command.kind), MessageId::new());
        let path = self.dir.join(name);

        tokio::fs::write(&path, &command.args)
            .await
            .map_err(|e| format!("cannot write {}: {e}", path.display()))?;
        debug!(path = %path.display(), "command spooled");
        Ok(())
    }
}
