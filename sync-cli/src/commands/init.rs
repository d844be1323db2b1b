//! Write a starter configuration file.

use anyhow::Result;
use peersync_peer::Config;
use std::path::Path;

use crate::config;

/// Run the init command.
pub async fn run(path: &Path, force: bool) -> Result<()> {
    let defaults = Config::default();
    config::save(&defaults, path, force).await?;

    println!("Configuration written to {}", path.display());
    println!();
    println!("  Advertised as: {}:{}", defaults.node.advertised_name, defaults.node.port);
    println!("  Share:         {}", defaults.sync.root.display());
    println!();
    println!("Next steps:");
    println!("  1. List the peers to join under [node] peers = [\"host:port\"]");
    println!("  2. Start the node: peersync run --config {}", path.display());

    Ok(())
}
