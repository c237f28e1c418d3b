//! Initialize client identity and the shared secret.

use anyhow::{Context, Result};
use std::path::Path;
use sync_client::{ClientRegistry, SharedSecret};

use crate::files::{load_secret, save_secret, AgentFiles};

/// Run the init command.
pub async fn run(files: &AgentFiles, import_secret: Option<&Path>) -> Result<()> {
    let _lock = files.acquire_lock()?;

    // Check if already initialized
    if files.registry.exists() {
        anyhow::bail!(
            "Client already initialized. Delete {} to reinitialize.",
            files.registry.display()
        );
    }

    let (secret, origin) = match import_secret {
        Some(path) => (load_secret(path).await?, "imported"),
        None if files.secret_file.exists() => (load_secret(&files.secret_file).await?, "kept"),
        None => (SharedSecret::random(), "generated"),
    };
    save_secret(&files.secret_file, &secret).await?;

    let registry = ClientRegistry::create(&files.registry)
        .await
        .context("Failed to create client registry")?;

    println!("Client initialized successfully!");
    println!();
    println!("  Client ID: {}", registry.client_id());
    println!("  Secret:    {} ({})", files.secret_file.display(), origin);
    println!("  Data dir:  {}", files.data_dir.display());
    println!();
    println!("Next steps:");
    if origin == "generated" {
        println!("  1. Copy the secret file to every other client (out of band)");
        println!("     and run 'queuesync-agent init --secret-file <file>' there");
    } else {
        println!("  1. Make sure every client shares this secret");
    }
    println!("  2. Configure queues and credentials, then: queuesync-agent run");

    Ok(())
}
