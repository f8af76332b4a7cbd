//! Node configuration
//!
//! Loaded once at startup from JSON or TOML, optionally overridden by CLI
//! flags, validated, then passed by value into every task. There are no
//! process-wide mutable settings.

use crate::consensus::ConsensusParams;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Root directory for block files, databases, and the wallet.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Host the P2P listener binds to.
    #[serde(default = "default_p2p_host")]
    pub p2p_host: String,

    /// Port the P2P listener binds to.
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,

    /// Port of the admin REST API.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    /// Run the miner. Non-mining nodes run the block download task
    /// instead.
    #[serde(default)]
    pub enable_mining: bool,

    /// Address of a peer to bootstrap discovery from.
    #[serde(default)]
    pub seed_peer: Option<String>,

    /// Seed for wallet key generation; random when absent.
    #[serde(default)]
    pub rng_seed: Option<i64>,

    /// Wipe the root directory on startup.
    #[serde(default)]
    pub clean_on_start: bool,

    /// Byte threshold after which the current block segment rolls over.
    #[serde(default = "default_block_file_size_limit")]
    pub block_file_size_limit: u64,

    /// Chain parameters.
    #[serde(default)]
    pub consensus: ConsensusParams,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./rustcoin")
}

fn default_p2p_host() -> String {
    "127.0.0.1".to_string()
}

fn default_p2p_port() -> u16 {
    9333
}

fn default_rpc_port() -> u16 {
    8765
}

fn default_block_file_size_limit() -> u64 {
    10 * 1024
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            root_dir: default_root_dir(),
            p2p_host: default_p2p_host(),
            p2p_port: default_p2p_port(),
            rpc_port: default_rpc_port(),
            enable_mining: false,
            seed_peer: None,
            rng_seed: None,
            clean_on_start: false,
            block_file_size_limit: default_block_file_size_limit(),
            consensus: ConsensusParams::default(),
        }
    }
}

impl NodeConfig {
    /// Loads a configuration file, dispatching on the extension: `.toml`
    /// parses as TOML, everything else as JSON.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("failed to parse TOML config: {}", e))
        } else {
            serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("failed to parse JSON config: {}", e))
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.p2p_port == self.rpc_port {
            return Err(anyhow::anyhow!(
                "p2p_port and rpc_port must differ (both {})",
                self.p2p_port
            ));
        }
        if self.consensus.retarget_interval == 0 {
            return Err(anyhow::anyhow!("retarget_interval must be positive"));
        }
        if self.consensus.expected_block_time == 0 {
            return Err(anyhow::anyhow!("expected_block_time must be positive"));
        }
        if self.consensus.max_block_size == 0 {
            return Err(anyhow::anyhow!("max_block_size must be positive"));
        }
        if self.block_file_size_limit == 0 {
            return Err(anyhow::anyhow!("block_file_size_limit must be positive"));
        }
        Ok(())
    }

    pub fn p2p_addr(&self) -> String {
        format!("{}:{}", self.p2p_host, self.p2p_port)
    }
}
