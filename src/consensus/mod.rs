//! Consensus rules: validation, proof of work, and chain parameters
//!
//! Everything in this module is pure with respect to storage: validation
//! reads unspent outputs through [`utxo::UtxoView`] and never mutates
//! anything. The engine in [`crate::node`] owns all state transitions.

pub mod block;
pub mod error;
pub mod merkle;
pub mod pow;
pub mod transaction;
pub mod utxo;

use serde::{Deserialize, Serialize};

/// Chain parameters, fixed at startup.
///
/// The defaults describe the only deployed network; tests override
/// individual fields (usually `initial_nbits`) through the config layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Difficulty of the genesis block and the minimum difficulty floor.
    #[serde(default = "default_initial_nbits")]
    pub initial_nbits: u32,

    /// Hard-coded genesis timestamp.
    #[serde(default = "default_genesis_time")]
    pub genesis_time: i64,

    /// Subsidy paid by every block's coinbase.
    #[serde(default = "default_block_reward")]
    pub block_reward: u32,

    /// Target seconds between blocks.
    #[serde(default = "default_expected_block_time")]
    pub expected_block_time: u32,

    /// Blocks between difficulty retargets.
    #[serde(default = "default_retarget_interval")]
    pub retarget_interval: u32,

    /// Tolerated distance between a block's timestamp and the wall clock,
    /// in seconds.
    #[serde(default = "default_time_window")]
    pub time_window: i64,

    /// Byte budget the miner packs transactions into.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,

    /// Blocks a coinbase output must age before it can be spent.
    /// Zero disables the check.
    #[serde(default)]
    pub coinbase_maturity: u32,
}

fn default_initial_nbits() -> u32 {
    0x1e7f_ffff
}

fn default_genesis_time() -> i64 {
    1_669_004_537
}

fn default_block_reward() -> u32 {
    1000
}

fn default_expected_block_time() -> u32 {
    15
}

fn default_retarget_interval() -> u32 {
    20
}

fn default_time_window() -> i64 {
    500
}

fn default_max_block_size() -> usize {
    10 * 1024
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            initial_nbits: default_initial_nbits(),
            genesis_time: default_genesis_time(),
            block_reward: default_block_reward(),
            expected_block_time: default_expected_block_time(),
            retarget_interval: default_retarget_interval(),
            time_window: default_time_window(),
            max_block_size: default_max_block_size(),
            coinbase_maturity: 0,
        }
    }
}
