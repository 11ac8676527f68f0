//! Standalone mining-pool service: a chain-backed Stratum server that hands
//! out jobs over the current head and submits accepted solutions back into
//! the chain.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nogochain::config::NodeConfig;
use nogochain::node::Node;
use nogochain::stratum::StratumServer;

#[derive(Parser)]
#[command(author, version, about = "NogoChain mining pool")]
struct Cli {
    /// Path to the pool configuration file.
    #[arg(short, long, default_value = "pool.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        NodeConfig::load(&cli.config)?
    } else {
        let mut config = NodeConfig::default();
        config.stratum.enabled = true;
        config.save(&cli.config)?;
        config
    };
    // The pool always runs its Stratum front end.
    config.stratum.enabled = true;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let listen_addr = config.stratum.listen_addr.clone();
    let node = Node::new({
        let mut node_config = config.clone();
        // The embedded node keeps its own services off; this process only
        // serves miners.
        node_config.stratum.enabled = false;
        node_config.rpc.enabled = false;
        node_config
    })?;
    let provider = node.work_provider()?;
    let pow = std::sync::Arc::new(nogochain::consensus::PowCache::new());
    let chain = node.chain();
    let handle = node.start().await?;

    let stratum = std::sync::Arc::new(StratumServer::new(provider, pow));
    let listener = TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "pool serving miners");
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let stratum_task = tokio::spawn(stratum.run(listener, chain.watch_head(), shutdown_rx));

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = stratum_task.await;
    handle.shutdown().await;
    Ok(())
}
