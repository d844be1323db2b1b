//! # peersync
//!
//! Command line front end for a peersync node.
//!
//! ## Commands
//!
//! - `init`: Write a starter configuration file
//! - `run`: Start a node and keep the share in sync until Ctrl-C
//!
//! ## Example
//!
//! ```bash
//! # Create peersync.toml in the current directory
//! peersync init
//!
//! # Edit [node] peers, then start syncing ./share
//! peersync run --config peersync.toml
//!
//! # More detail
//! RUST_LOG=peersync_peer=debug peersync run
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{init, run};

/// Peer-to-peer directory synchronization.
#[derive(Parser, Debug)]
#[command(name = "peersync")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a configuration file with default values
    Init {
        /// Where to write the file
        #[arg(long, short, default_value = config::DEFAULT_CONFIG_FILE)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Start a node
    Run {
        /// Configuration file
        #[arg(long, short, default_value = config::DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli.command {
        Commands::Init { path, force } => {
            init::run(&path, force).await?;
        }
        Commands::Run { config } => {
            run::run(&config).await?;
        }
    }

    Ok(())
}
