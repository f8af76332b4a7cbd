//! Consensus rejection kinds
//!
//! Every way a block or transaction can fail validation gets its own
//! variant, so accept paths can log precisely and tests can assert on the
//! exact rejection. Rejections are never fatal: the offending item is
//! dropped and no state changes. `Store` is the one exception; it reports
//! a failed read of the backing store and aborts the in-flight acceptance.

use crate::types::Hash256;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("block timestamp outside the allowed window")]
    BadTime,

    #[error("block difficulty does not match the expected nBits")]
    BadDifficulty,

    #[error("merkle root does not commit to the block's transactions")]
    BadMerkle,

    #[error("cached block hash does not match the header")]
    BadPow,

    #[error("header hash does not meet the difficulty target")]
    InsufficientWork,

    #[error("first transaction is not a coinbase")]
    MissingCoinbase,

    #[error("referenced output {txid}:{vout} is missing or already spent")]
    MissingInput { txid: Hash256, vout: u32 },

    #[error("embedded public key does not hash to the output's key hash")]
    WrongKey,

    #[error("signature verification failed")]
    BadSignature,

    #[error("output value exceeds input value or overflows")]
    OverSpend,

    #[error("coinbase output exceeds block reward plus fees")]
    BadCoinbase,

    #[error("inputs are not all signed by the same sender")]
    MultipleSenders,

    #[error("block height does not follow its parent")]
    BadHeight,

    #[error("transaction has no inputs or no outputs")]
    Empty,

    #[error("coinbase output spent before maturity")]
    ImmatureSpend,

    #[error("transaction {0} is already in the mempool")]
    DuplicateTransaction(Hash256),

    #[error("input conflicts with a transaction already in the mempool")]
    MempoolConflict,

    #[error("difficulty target out of representable range")]
    BadTarget,

    #[error("store access failed: {0}")]
    Store(String),
}

impl ConsensusError {
    /// True for the one variant that signals an IO problem rather than an
    /// invalid block or transaction.
    pub fn is_store_error(&self) -> bool {
        matches!(self, ConsensusError::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
