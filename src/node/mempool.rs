//! Fee-ordered pool of validated unconfirmed transactions
//!
//! Entries are kept sorted by descending fee. A side index from spent
//! outpoint to pool txid rejects transactions that try to consume an
//! output some pooled transaction already spends. The pool is not
//! persisted; a restart starts empty.

use crate::consensus::error::{ConsensusError, Result};
use crate::consensus::transaction::Transaction;
use crate::consensus::utxo::{OutPoint, UtxoView};
use crate::types::Hash256;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, info};

/// A pooled transaction with its fee at admission time.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    pub fee: u32,
}

#[derive(Default)]
struct Inner {
    /// Sorted by descending fee.
    entries: Vec<MempoolEntry>,
    txids: HashSet<Hash256>,
    /// Outpoint -> txid of the pooled transaction spending it.
    spent: HashMap<OutPoint, Hash256>,
}

#[derive(Default)]
pub struct Mempool {
    inner: Mutex<Inner>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mempool lock poisoned")
    }

    /// Validates `tx` against `view` and inserts it in fee order.
    pub fn accept(&self, tx: Transaction, view: &dyn UtxoView) -> Result<u32> {
        let txid = tx.hash();
        tx.verify(view)?;
        let fee = tx.fee(view)?;

        let mut inner = self.lock();
        if inner.txids.contains(&txid) {
            return Err(ConsensusError::DuplicateTransaction(txid));
        }
        for input in &tx.ins {
            if inner.spent.contains_key(&input.outpoint()) {
                return Err(ConsensusError::MempoolConflict);
            }
        }

        for input in &tx.ins {
            inner.spent.insert(input.outpoint(), txid);
        }
        inner.txids.insert(txid);
        let position = inner
            .entries
            .iter()
            .position(|entry| fee > entry.fee)
            .unwrap_or(inner.entries.len());
        inner.entries.insert(position, MempoolEntry { tx, txid, fee });

        info!(%txid, fee, "transaction added to mempool");
        Ok(fee)
    }

    /// Removes a transaction by id, if present.
    pub fn purge(&self, txid: &Hash256) {
        let mut inner = self.lock();
        if let Some(position) = inner.entries.iter().position(|entry| &entry.txid == txid) {
            let entry = inner.entries.remove(position);
            inner.txids.remove(txid);
            for input in &entry.tx.ins {
                inner.spent.remove(&input.outpoint());
            }
            debug!(%txid, "transaction removed from mempool");
        }
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.lock().txids.contains(txid)
    }

    /// Fee-descending copy of the pool.
    pub fn snapshot(&self) -> Vec<MempoolEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Drops every entry. Used when a reorganization leaves the pool
    /// stale relative to the new chain.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.txids.clear();
        inner.spent.clear();
        if dropped > 0 {
            info!(dropped, "mempool cleared");
        }
    }
}
