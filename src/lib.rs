//! rustcoin - a minimal proof-of-work cryptocurrency node
//!
//! This crate implements a small Bitcoin-style currency: a locally persisted
//! append-only chain of blocks, a UTXO set, a fee-ordered mempool, a miner,
//! and a peer-to-peer gossip layer. The consensus engine owns every mutation
//! of persistent state; the wallet and admin API observe it through
//! read-only views and registered callbacks.
//!
//! ## Layout
//!
//! - [`consensus`]: block/transaction validation, proof of work, difficulty
//!   retargeting, Merkle trees, the UTXO model
//! - [`codec`]: canonical byte encodings for every persisted or gossiped type
//! - [`storage`]: segmented block/undo files plus the sled-backed block index
//!   and chain state
//! - [`node`]: the consensus engine task, mempool, miner, and orchestration
//! - [`network`]: wire protocol, peer registry, gossip and sync tasks
//! - [`rpc`]: REST/JSON administration API
//! - [`wallet`]: persisted RSA key wallet, driven by engine callbacks

pub mod codec;
pub mod config;
pub mod consensus;
pub mod network;
pub mod node;
pub mod rpc;
pub mod storage;
pub mod types;
pub mod wallet;

pub use config::NodeConfig;
pub use consensus::block::{Block, BlockBuilder, BlockHeader};
pub use consensus::error::ConsensusError;
pub use consensus::transaction::{Transaction, TxIn, TxOut};
pub use consensus::utxo::{OutPoint, Utxo, UtxoView};
pub use types::{Hash160, Hash256};
