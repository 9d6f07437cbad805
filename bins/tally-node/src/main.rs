//! Tally indexer binary.
//!
//! Loads configuration, opens the ledger, connects to the trusted peers, and
//! keeps the local UTXO index in sync until interrupted.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tally_indexer::{Indexer, IndexerConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "tally-node",
    version,
    about = "Reorg-aware chain sync and UTXO indexer"
)]
struct Args {
    /// TOML configuration file. `TALLY__*` environment variables override it.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Data directory for the ledger, sync state, and node key
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Chain name (e.g. TALLY, BTC)
    #[arg(long)]
    chain: Option<String>,

    /// Network name (mainnet, testnet, regtest)
    #[arg(long)]
    network: Option<String>,

    /// Trusted peer multiaddrs (comma-separated)
    #[arg(long = "peer", value_delimiter = ',')]
    peers: Vec<String>,

    /// P2P listen port
    #[arg(long)]
    p2p_port: Option<u16>,

    /// Wallet tagging workers; 0 tags inline
    #[arg(long)]
    workers: Option<usize>,

    /// Log level or filter directive (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    /// Apply command-line overrides on top of the loaded config.
    fn apply(&self, config: &mut IndexerConfig) {
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(chain) = &self.chain {
            config.chain = chain.clone();
        }
        if let Some(network) = &self.network {
            config.network = network.clone();
        }
        for peer in &self.peers {
            if !config.trusted_peers.contains(peer) {
                config.trusted_peers.push(peer.clone());
            }
        }
        if let Some(port) = self.p2p_port {
            config.p2p.listen_port = port;
        }
        if let Some(workers) = self.workers {
            config.pool_workers = workers;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = IndexerConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    init_logging(&config.log_level, &args.log_format);

    info!("Tally indexer v{}", env!("CARGO_PKG_VERSION"));
    info!(chain = %config.chain_network(), "chain");
    info!(data_dir = %config.data_dir.display(), "data directory");
    info!(p2p_listen = %config.p2p.listen_multiaddr(), "p2p listen address");
    info!(peers = ?config.network_config().trusted_peers, "trusted peers");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    let indexer = Indexer::start(config).await.context("starting indexer")?;
    info!("indexer running (Ctrl+C to stop)");

    let shutdown_signal = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C, shutting down..."),
            Err(e) => error!("failed to listen for Ctrl+C: {e}"),
        }
    };

    tokio::select! {
        result = indexer.run() => {
            if let Err(e) = result {
                error!("indexer stopped: {e}");
            }
        }
        _ = shutdown_signal => {}
    }

    indexer.shutdown().await.context("shutting down")?;
    info!("Tally indexer shutdown complete");
    Ok(())
}

/// Initialize the tracing subscriber.
///
/// `format = "json"` emits one JSON object per line; anything else is text.
/// `RUST_LOG` takes precedence over `level`.
fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
