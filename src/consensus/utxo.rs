//! Unspent transaction outputs and views over them
//!
//! A [`Utxo`] is identified by `(txid, vout)`. Validation reads outputs
//! through the [`UtxoView`] trait so the same verification code runs against
//! the persisted chain state, and against an in-memory overlay that tracks
//! the effects of earlier transactions while a block is being verified.

use crate::consensus::error::{ConsensusError, Result};
use crate::consensus::transaction::Transaction;
use crate::types::{Hash160, Hash256};
use std::collections::{HashMap, HashSet};

/// Reference to a transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        OutPoint { txid, vout }
    }
}

/// An unspent transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub txid: Hash256,
    pub vout: u32,
    pub value: u32,
    pub pubkey_hash: Hash160,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// Read access to a set of unspent outputs.
///
/// `Ok(None)` means the output does not exist (never created, or already
/// spent); `Err` reports a failure of the backing store, which is a
/// different outcome entirely.
pub trait UtxoView {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>>;
}

/// In-memory overlay over a base view.
///
/// While a block is verified transaction by transaction, each transaction
/// must observe the spends and outputs of its predecessors in the same
/// block. The overlay records both without touching the base.
pub struct UtxoOverlay<'a> {
    base: &'a dyn UtxoView,
    created: HashMap<OutPoint, Utxo>,
    spent: HashSet<OutPoint>,
}

impl<'a> UtxoOverlay<'a> {
    pub fn new(base: &'a dyn UtxoView) -> Self {
        UtxoOverlay {
            base,
            created: HashMap::new(),
            spent: HashSet::new(),
        }
    }

    /// Records the effects of a verified transaction: its inputs become
    /// spent, its outputs become spendable.
    pub fn apply(&mut self, tx: &Transaction) {
        let txid = tx.hash();
        if !tx.is_coinbase() {
            for input in &tx.ins {
                let outpoint = OutPoint::new(input.prev_txid, input.vout);
                self.created.remove(&outpoint);
                self.spent.insert(outpoint);
            }
        }
        for (vout, out) in tx.outs.iter().enumerate() {
            let utxo = Utxo {
                txid,
                vout: vout as u32,
                value: out.value,
                pubkey_hash: out.pubkey_hash,
            };
            self.created.insert(utxo.outpoint(), utxo);
        }
    }
}

impl UtxoView for UtxoOverlay<'_> {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        if self.spent.contains(outpoint) {
            return Ok(None);
        }
        if let Some(utxo) = self.created.get(outpoint) {
            return Ok(Some(utxo.clone()));
        }
        self.base.utxo(outpoint)
    }
}

/// A fixed in-memory UTXO set, mainly for tests and verification helpers.
#[derive(Default)]
pub struct MemoryUtxoSet {
    utxos: HashMap<OutPoint, Utxo>,
}

impl MemoryUtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, utxo: Utxo) {
        self.utxos.insert(utxo.outpoint(), utxo);
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        self.utxos.remove(outpoint)
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }
}

impl UtxoView for MemoryUtxoSet {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        Ok(self.utxos.get(outpoint).cloned())
    }
}

/// Convenience lookup that converts a missing output into `MissingInput`.
pub fn require_utxo(view: &dyn UtxoView, outpoint: &OutPoint) -> Result<Utxo> {
    view.utxo(outpoint)?.ok_or(ConsensusError::MissingInput {
        txid: outpoint.txid,
        vout: outpoint.vout,
    })
}
