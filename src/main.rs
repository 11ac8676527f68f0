use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nogochain::config::NodeConfig;
use nogochain::node::Node;

#[derive(Parser)]
#[command(author, version, about = "NogoChain full node")]
struct Cli {
    /// Path to the node configuration file.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        NodeConfig::load(&cli.config)?
    } else {
        let config = NodeConfig::default();
        config.save(&cli.config)?;
        config
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let node = Node::new(config)?;
    let handle = node.start().await?;

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    handle.shutdown().await;
    Ok(())
}
