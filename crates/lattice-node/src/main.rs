use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lattice_node::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(
    name = "lattice-node",
    about = "Lattice - partitioned, snapshot-isolated graph store write path",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run ingestors and storage nodes in this process
    Run {
        /// Configuration file (TOML, YAML or JSON)
        #[arg(short, long, env = "LATTICE_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Validate the configuration and exit
    Check {
        #[arg(short, long, env = "LATTICE_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lattice=info")),
        )
        .init();

    info!("Lattice node version {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Run { config } => run(NodeConfig::load(config.as_deref()).await?).await,
        Commands::Check { config } => {
            let config = NodeConfig::load(config.as_deref()).await?;
            info!(
                stores = config.cluster.store_count,
                ingestors = config.cluster.ingestor_count,
                queues = config.cluster.queue_count,
                partitions = config.cluster.partition_count,
                wal_dir = %config.wal.data_dir.display(),
                "Configuration is valid"
            );
            Ok(())
        }
    }
}

async fn run(config: NodeConfig) -> Result<()> {
    let node = Node::start(config).await?;
    info!("Lattice node is ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");
    node.shutdown().await;
    Ok(())
}
