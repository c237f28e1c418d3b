//! # queuesync-agent
//!
//! Operator agent for queuesync.
//!
//! ## Commands
//!
//! - `init`: Create the client registry and shared secret
//! - `run`: Run the relay and sync loops until Ctrl+C
//! - `send`: Send one command to every other client
//! - `status`: Show identity, peer revisions and queue depths
//! - `touch`: Write one record locally and push a snapshot
//!
//! ## Example
//!
//! ```bash
//! # First client creates the deployment secret
//! queuesync-agent init
//!
//! # Other clients import it
//! queuesync-agent init --secret-file shared.key
//!
//! # Run the loops
//! QUEUESYNC_TOKEN=... queuesync-agent --config site-a.toml run
//!
//! # Send a print command
//! queuesync-agent send --kind print --file label.zpl
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod executor;
mod files;
mod store;

use commands::{init, run, send, status, touch};
use files::AgentFiles;

/// Operator agent for queuesync.
#[derive(Parser, Debug)]
#[command(name = "queuesync-agent")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: platform config dir, queuesync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use an in-memory queue instead of the configured service (for testing/demo)
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the client registry and shared secret
    Init {
        /// Import an existing hex-encoded shared secret instead of generating one
        #[arg(long)]
        secret_file: Option<PathBuf>,
    },

    /// Run the relay and sync loops until Ctrl+C
    Run,

    /// Send one command
    Send {
        /// Command kind, e.g. "print"
        #[arg(long, short)]
        kind: String,

        /// Command arguments (or use --file)
        args: Option<String>,

        /// File whose contents are the command arguments
        #[arg(long, short, conflicts_with = "args")]
        file: Option<PathBuf>,
    },

    /// Show identity, peer revisions and queue depths
    Status,

    /// Write one record locally and push a snapshot (not while `run` is active)
    Touch {
        /// Record id
        #[arg(long)]
        id: String,

        /// Record body as JSON
        #[arg(long, required_unless_present = "delete")]
        body: Option<String>,

        /// Parent record id
        #[arg(long)]
        parent: Option<String>,

        /// Write a tombstone instead of a live record
        #[arg(long, conflicts_with = "body")]
        delete: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = files::load_config(cli.config.as_deref())?;
    let files = AgentFiles::from_config(&config)?;

    tokio::fs::create_dir_all(&files.data_dir)
        .await
        .context("Failed to create data directory")?;

    match cli.command {
        Commands::Init { secret_file } => {
            init::run(&files, secret_file.as_deref()).await?;
        }
        Commands::Run => {
            run::run(&config, &files, cli.mock).await?;
        }
        Commands::Send { kind, args, file } => {
            let args = if let Some(text) = args {
                text.into_bytes()
            } else if let Some(path) = file {
                tokio::fs::read(&path)
                    .await
                    .context("Failed to read file")?
            } else {
                Vec::new()
            };
            send::run(&config, &files, &kind, args, cli.mock).await?;
        }
        Commands::Status => {
            status::run(&config, &files, cli.mock).await?;
        }
        Commands::Touch {
            id,
            body,
            parent,
            delete,
        } => {
            let body = match body {
                Some(text) if !delete => {
                    Some(serde_json::from_str(&text).context("--body is not valid JSON")?)
                }
                _ => None,
            };
            touch::run(&config, &files, touch::Change { id, body, parent }, cli.mock).await?;
        }
    }

    Ok(())
}
