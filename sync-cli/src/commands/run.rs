//! Start a node and serve until interrupted.

use anyhow::{Context, Result};
use peersync_peer::{LocalFileStore, Node, ScanEventSource};
use std::path::Path;
use std::sync::Arc;

use crate::config;

/// Run the run command.
pub async fn run(config_path: &Path) -> Result<()> {
    let config = config::load(config_path)?;
    let root = config.sync.root.clone();

    tokio::fs::create_dir_all(&root)
        .await
        .with_context(|| format!("Failed to create share directory {}", root.display()))?;
    let store = LocalFileStore::open(&root)
        .await
        .with_context(|| format!("Failed to open share directory {}", root.display()))?;
    let events = ScanEventSource::new(&root);

    let (node, listener) = Node::bind(config, Arc::new(store), Arc::new(events))
        .await
        .context("Failed to start node")?;
    tracing::info!("Sharing {}", root.display());

    let stopper = node.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            stopper.shutdown();
        }
    });

    node.run(listener).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_config_is_an_error() {
        let dir = tempdir().unwrap();
        let err = run(&dir.path().join("absent.toml")).await.unwrap_err();
        assert!(err.to_string().contains("Failed to load configuration"));
    }
}
