//! Miner: assembles candidate blocks and searches for a valid nonce
//!
//! Runs as a cancellable task. Each round reads the mining context
//! (beneficiary address and current tip), packs the highest-fee mempool
//! transactions into the size budget, prepends the coinbase, and counts
//! nonces until the header meets the target or the engine cancels the
//! round because the tip moved. Mined blocks are submitted through the
//! same ingress queue as gossiped ones.

use crate::consensus::block::{Block, BlockBuilder};
use crate::consensus::transaction::Transaction;
use crate::consensus::ConsensusParams;
use crate::node::engine::{expected_nbits, MiningContext};
use crate::node::mempool::Mempool;
use crate::storage::Storage;
use crate::types::{unix_now, Hash160, Hash256};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Nonces tried between cancellation checks.
const NONCE_BATCH: u32 = 20_000;

pub struct Miner {
    storage: Arc<Storage>,
    mempool: Arc<Mempool>,
    params: ConsensusParams,
    mining: Arc<Mutex<MiningContext>>,
    submit: mpsc::Sender<Block>,
}

impl Miner {
    pub fn new(
        storage: Arc<Storage>,
        mempool: Arc<Mempool>,
        params: ConsensusParams,
        mining: Arc<Mutex<MiningContext>>,
        submit: mpsc::Sender<Block>,
    ) -> Self {
        Miner {
            storage,
            mempool,
            params,
            mining,
            submit,
        }
    }

    /// Mines until the submit channel closes.
    pub async fn run(self) {
        info!("miner started");
        loop {
            let (address, prev_hash, prev_height, cancel) = {
                let ctx = self.mining.lock().expect("mining context lock poisoned");
                (
                    ctx.address,
                    ctx.prev_hash,
                    ctx.prev_height,
                    ctx.cancel.clone(),
                )
            };

            match self.mine_one(address, prev_hash, prev_height, &cancel).await {
                Ok(Some(block)) => {
                    info!(hash = %block.hash, height = block.height, "mined a block");
                    if self.submit.send(block).await.is_err() {
                        info!("engine queue closed, miner stopping");
                        return;
                    }
                }
                Ok(None) => {
                    // Tip or address changed mid-search; the next round
                    // picks up the fresh context.
                    debug!("nonce search cancelled");
                }
                Err(e) => {
                    warn!("mining round failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Packs a candidate on `prev_hash` and searches for its nonce.
    /// Returns `None` when cancelled.
    async fn mine_one(
        &self,
        address: Hash160,
        prev_hash: Hash256,
        prev_height: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<Block>> {
        let height = prev_height.wrapping_add(1);
        let nbits = expected_nbits(&self.storage, &self.params, height)?;

        // Highest fee first, until the size budget runs out.
        let mut total_fee = 0u32;
        let mut block_size = 0usize;
        let mut selected: Vec<Transaction> = Vec::new();
        for entry in self.mempool.snapshot() {
            let tx_size = crate::codec::tx::encode(&entry.tx).len();
            if block_size + tx_size > self.params.max_block_size {
                break;
            }
            debug!(txid = %entry.txid, fee = entry.fee, "selected transaction");
            total_fee = total_fee.saturating_add(entry.fee);
            block_size += tx_size;
            selected.push(entry.tx);
        }

        let coinbase = Transaction::coinbase(
            format!("mined@{}", unix_now()).into_bytes(),
            address,
            self.params.block_reward,
            total_fee,
        );

        let mut builder = BlockBuilder::new()
            .base_on(prev_hash, prev_height)
            .nbits(nbits)
            .time(unix_now())
            .add_transaction(coinbase);
        for tx in selected {
            builder = builder.add_transaction(tx);
        }

        debug!(height, nbits = format_args!("{:08x}", nbits), "starting nonce search");
        let mut header = builder.sealed_header();
        loop {
            for _ in 0..NONCE_BATCH {
                if crate::consensus::pow::hash_meets_target(&header.hash(), header.nbits)? {
                    return Ok(Some(builder.finish(header.nonce)));
                }
                header.nonce = header.nonce.wrapping_add(1);
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }
            // Keep the search cooperative with the rest of the runtime.
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_search_returns_none() {
        // Impossible target (zero mantissa): only cancellation ends the
        // search.
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let mempool = Arc::new(Mempool::new());
        let params = ConsensusParams {
            initial_nbits: 0x0300_0000,
            ..Default::default()
        };
        let mining = Arc::new(Mutex::new(MiningContext {
            address: Hash160::ZERO,
            prev_hash: Hash256::ZERO,
            prev_height: u32::MAX,
            cancel: CancellationToken::new(),
        }));
        let (tx, _rx) = mpsc::channel(1);
        let miner = Miner::new(storage, mempool, params, Arc::clone(&mining), tx);

        let cancel = mining.lock().unwrap().cancel.clone();
        let search = miner.mine_one(Hash160::ZERO, Hash256::ZERO, u32::MAX, &cancel);
        tokio::pin!(search);

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => cancel.cancel(),
            _ = &mut search => panic!("search finished against impossible target"),
        }
        assert!(search.await.unwrap().is_none());
    }
}
