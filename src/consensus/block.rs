//! Blocks: header, body, verification, and assembly
//!
//! The block hash is a single SHA-256 over the canonical 80-byte header
//! encoding. Verification checks the header against wall clock, expected
//! difficulty and proof of work, then validates the transaction list over
//! an in-block UTXO overlay so intra-block spends resolve in order.

use crate::consensus::error::{ConsensusError, Result};
use crate::consensus::merkle::merkle_root;
use crate::consensus::pow::{expand_target, hash_meets_target, U256};
use crate::consensus::transaction::Transaction;
use crate::consensus::utxo::{UtxoOverlay, UtxoView};
use crate::types::{sha256, Hash256};

/// Fixed-size block header. Its canonical encoding is 80 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    /// Seconds since epoch at assembly time.
    pub time: i64,
    /// Compact difficulty target.
    pub nbits: u32,
    /// Proof-of-work counter.
    pub nonce: u32,
    pub prev_block_hash: Hash256,
    pub merkle_root: Hash256,
}

impl BlockHeader {
    /// SHA-256 of the canonical header bytes.
    pub fn hash(&self) -> Hash256 {
        sha256(&crate::codec::block::encode_header(self))
    }

    /// Expanded difficulty target.
    pub fn target(&self) -> Result<U256> {
        expand_target(self.nbits)
    }
}

/// Header plus ordered, non-empty transaction list.
///
/// `hash` and `height` are carried alongside the consensus data: the hash
/// caches the header digest, the height locates the block in the chain and
/// is part of the canonical block encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub hash: Hash256,
    pub height: u32,
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Recomputes the Merkle root over the transaction list.
    pub fn merkle_root(&self) -> Hash256 {
        let hashes: Vec<Hash256> = self.transactions.iter().map(|tx| tx.hash()).collect();
        merkle_root(&hashes)
    }

    /// Total fee collected by the block's non-coinbase transactions,
    /// evaluated against `view` with in-block spends applied in order.
    pub fn total_fee(&self, view: &dyn UtxoView) -> Result<u32> {
        let mut overlay = UtxoOverlay::new(view);
        let mut total = 0u64;
        for tx in &self.transactions {
            total += tx.fee(&overlay)? as u64;
            overlay.apply(tx);
        }
        u32::try_from(total).map_err(|_| ConsensusError::OverSpend)
    }

    /// Full block validation.
    ///
    /// `now` is the wall clock at validation; the header time must be
    /// within `time_window` seconds of it. `expected_nbits` comes from the
    /// difficulty schedule, `reward` bounds the coinbase payout.
    pub fn verify(
        &self,
        view: &dyn UtxoView,
        expected_nbits: u32,
        time_window: i64,
        reward: u32,
        now: i64,
    ) -> Result<()> {
        if (now - self.header.time).abs() > time_window {
            return Err(ConsensusError::BadTime);
        }
        if self.header.nbits != expected_nbits {
            return Err(ConsensusError::BadDifficulty);
        }
        if self.merkle_root() != self.header.merkle_root {
            return Err(ConsensusError::BadMerkle);
        }
        // The cached hash is what peers and indexes refer to; it must be
        // the hash of this very header.
        if self.hash != self.header.hash() {
            return Err(ConsensusError::BadPow);
        }
        if !hash_meets_target(&self.hash, self.header.nbits)? {
            return Err(ConsensusError::InsufficientWork);
        }

        if self.transactions.is_empty() || !self.transactions[0].is_coinbase() {
            return Err(ConsensusError::MissingCoinbase);
        }

        let mut overlay = UtxoOverlay::new(view);
        let mut fee = 0u64;
        for tx in &self.transactions {
            tx.verify(&overlay)?;
            fee += tx.fee(&overlay)? as u64;
            overlay.apply(tx);
        }
        let fee = u32::try_from(fee).map_err(|_| ConsensusError::OverSpend)?;

        let coinbase_out = self.transactions[0]
            .output_sum()
            .ok_or(ConsensusError::OverSpend)? as u64;
        if coinbase_out > reward as u64 + fee as u64 {
            return Err(ConsensusError::BadCoinbase);
        }

        Ok(())
    }
}

/// Step-by-step block assembly ending in a proof-of-work search.
pub struct BlockBuilder {
    header: BlockHeader,
    height: u32,
    transactions: Vec<Transaction>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        BlockBuilder {
            header: BlockHeader::default(),
            height: 0,
            transactions: Vec::new(),
        }
    }

    /// Chains the block onto `prev_hash` at `prev_height + 1`.
    pub fn base_on(mut self, prev_hash: Hash256, prev_height: u32) -> Self {
        self.header.prev_block_hash = prev_hash;
        self.height = prev_height.wrapping_add(1);
        self
    }

    pub fn nbits(mut self, nbits: u32) -> Self {
        self.header.nbits = nbits;
        self
    }

    pub fn time(mut self, time: i64) -> Self {
        self.header.time = time;
        self
    }

    pub fn add_transaction(mut self, tx: Transaction) -> Self {
        self.transactions.push(tx);
        self
    }

    /// Current header with the Merkle root filled in; used by nonce
    /// searches that run outside the builder.
    pub fn sealed_header(&self) -> BlockHeader {
        let hashes: Vec<Hash256> = self.transactions.iter().map(|tx| tx.hash()).collect();
        let mut header = self.header;
        header.merkle_root = merkle_root(&hashes);
        header
    }

    /// Finishes assembly with an externally found nonce.
    pub fn finish(self, nonce: u32) -> Block {
        let mut header = self.sealed_header();
        header.nonce = nonce;
        Block {
            hash: header.hash(),
            height: self.height,
            header,
            transactions: self.transactions,
        }
    }

    /// Synchronous nonce search from zero. Used for the deterministic
    /// genesis block and in tests; the miner task runs its own cancellable
    /// search instead.
    pub fn build(self) -> Result<Block> {
        let mut header = self.sealed_header();
        loop {
            if hash_meets_target(&header.hash(), header.nbits)? {
                break;
            }
            header.nonce = header
                .nonce
                .checked_add(1)
                .ok_or(ConsensusError::InsufficientWork)?;
        }
        Ok(Block {
            hash: header.hash(),
            height: self.height,
            header,
            transactions: self.transactions,
        })
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}
