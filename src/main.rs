// Copyright (c) 2024 Botho Foundation

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use peerpigeon::config::{self, NodeConfig};
use peerpigeon::{telemetry, Node};

#[derive(Parser)]
#[command(name = "peerpigeon-node")]
#[command(about = "A browser-capable peer-to-peer mesh networking node", long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.peerpigeon/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose (debug-level) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file and exit
    Init {
        /// Signaling hub to announce to
        #[arg(long)]
        hub: Option<String>,
    },
    /// Run the node until interrupted
    Run,
    /// Print the node's identity and exit
    Id,
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(config::default_config_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = config_path(&cli);

    match &cli.command {
        Commands::Init { hub } => {
            let mut config = NodeConfig::default();
            if let Some(hub) = hub {
                config.hub_uri = hub.clone();
            }
            config.save(&path).with_context(|| format!("writing config to {}", path.display()))?;
            println!("wrote config to {}", path.display());
            Ok(())
        }
        Commands::Id => {
            let config = load_or_default(&path)?;
            let id = config.peer_id.unwrap_or_else(peerpigeon::PeerId::new_random);
            println!("{id}");
            Ok(())
        }
        Commands::Run => run(cli.verbose, &path).await,
    }
}

fn load_or_default(path: &PathBuf) -> Result<NodeConfig> {
    if path.exists() {
        NodeConfig::load(path)
    } else {
        Ok(NodeConfig::default())
    }
}

async fn run(verbose: bool, path: &PathBuf) -> Result<()> {
    let config = load_or_default(path)?;
    let _telemetry_guard = telemetry::init_tracing(&config.telemetry, verbose)?;

    let node = Node::new(config, None).await.context("starting node")?;
    tracing::info!(peer_id = %node.self_id, "peerpigeon node running");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let mut shutdown_tx = Some(shutdown_tx);
    ctrlc::set_handler(move || {
        if let Some(tx) = shutdown_tx.take() {
            let _ = tx.send(());
        }
    })
    .context("installing Ctrl-C handler")?;

    let _ = shutdown_rx.await;
    tracing::info!("shutdown signal received");
    node.shutdown().await;
    Ok(())
}
