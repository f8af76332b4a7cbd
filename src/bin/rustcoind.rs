//! rustcoind - run a rustcoin node
//!
//! Configuration comes from an optional JSON/TOML file with CLI flags
//! layered on top.

use clap::Parser;
use rustcoin::node::Node;
use rustcoin::NodeConfig;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rustcoind", about = "A minimal proof-of-work cryptocurrency node")]
struct Args {
    /// Configuration file (JSON or TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory for chain data, databases, and the wallet.
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Host the P2P listener binds to.
    #[arg(long)]
    p2p_host: Option<String>,

    /// Port the P2P listener binds to.
    #[arg(long)]
    p2p_port: Option<u16>,

    /// Port of the admin REST API.
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Run the miner.
    #[arg(long)]
    mine: bool,

    /// Peer address to bootstrap discovery from.
    #[arg(long)]
    seed_peer: Option<String>,

    /// Seed for wallet key generation (deterministic keys).
    #[arg(long)]
    rng_seed: Option<i64>,

    /// Wipe the root directory before starting.
    #[arg(long)]
    clean_on_start: bool,
}

fn build_config(args: Args) -> anyhow::Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };

    if let Some(root_dir) = args.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(host) = args.p2p_host {
        config.p2p_host = host;
    }
    if let Some(port) = args.p2p_port {
        config.p2p_port = port;
    }
    if let Some(port) = args.rpc_port {
        config.rpc_port = port;
    }
    if args.mine {
        config.enable_mining = true;
    }
    if let Some(seed) = args.seed_peer {
        config.seed_peer = Some(seed);
    }
    if let Some(seed) = args.rng_seed {
        config.rng_seed = Some(seed);
    }
    if args.clean_on_start {
        config.clean_on_start = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = build_config(Args::parse())?;
    info!(
        root = %config.root_dir.display(),
        p2p = %config.p2p_addr(),
        rpc = config.rpc_port,
        mining = config.enable_mining,
        "starting rustcoind"
    );

    let node = Node::new(config)?;
    node.start().await
}
