//! Consensus engine: block acceptance, orphan branches, reorganization
//!
//! The engine is the only writer of the block index, chain state, block
//! files, mempool, and orphan branch. Inbound blocks arrive through a
//! bounded queue and are processed one at a time; each acceptance commits
//! through a single store transaction whose last write is the tip pointer,
//! so a crash never leaves a half-applied block. Reorganization is a
//! sequence of such per-block transactions and may shorten the chain if
//! interrupted; the node then resyncs from peers.

use crate::consensus::block::{Block, BlockBuilder};
use crate::consensus::error::ConsensusError;
use crate::consensus::pow::retarget;
use crate::consensus::transaction::Transaction;
use crate::consensus::utxo::Utxo;
use crate::consensus::ConsensusParams;
use crate::node::mempool::Mempool;
use crate::storage::blockindex::{self, BlockIndexRecord, TransactionRecord};
use crate::storage::chainstate;
use crate::storage::Storage;
use crate::types::{unix_now, Hash160, Hash256};
use anyhow::{anyhow, Context, Result};
use sled::Transactional;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the inbound block queue. When full, peer handlers block,
/// throttling the network to consensus speed.
pub const BLOCK_QUEUE_CAPACITY: usize = 100;

/// Key/value write set applied to one tree inside the acceptance
/// transaction; `None` deletes the key.
type WriteOps = Vec<(Vec<u8>, Option<Vec<u8>>)>;

/// Callback for durably accepted blocks. Runs after the store commit.
pub trait BlockObserver: Send + Sync {
    fn block_accepted(&self, block: &Block);
}

/// Callback for blocks rolled back during reorganization, deepest first,
/// with the undo list that restored their spent outputs.
pub trait ReorgObserver: Send + Sync {
    fn reorg_rollback(&self, block: &Block, undo: &[Utxo]);
}

/// What the miner builds on, plus the token that interrupts its current
/// nonce search whenever any field changes.
pub struct MiningContext {
    pub address: Hash160,
    pub prev_hash: Hash256,
    pub prev_height: u32,
    pub cancel: CancellationToken,
}

/// How the engine disposed of an inbound block.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockDisposition {
    /// Extended the active chain.
    ExtendedTip,
    /// Started a new orphan branch off a stale on-chain block.
    OrphanRoot,
    /// Appended to the tracked orphan branch, no reorganization yet.
    OrphanExtended,
    /// The orphan branch overtook the active chain and replaced it.
    Reorganized,
    /// Hash already known (indexed or in the branch).
    Duplicate,
    /// Parent unknown; not retained.
    Dropped,
    /// Failed validation; nothing persisted.
    Rejected(ConsensusError),
}

pub struct ConsensusEngine {
    storage: Arc<Storage>,
    mempool: Arc<Mempool>,
    params: ConsensusParams,
    block_file_size_limit: u64,
    branch: Mutex<Vec<Block>>,
    block_observers: Vec<Arc<dyn BlockObserver>>,
    reorg_observers: Vec<Arc<dyn ReorgObserver>>,
    mining: Arc<Mutex<MiningContext>>,
}

/// The hard-coded genesis block, identical on every node: fixed coinbase
/// bytes and timestamp, zero beneficiary, nonce found by deterministic
/// search from zero.
pub fn genesis_block(params: &ConsensusParams) -> Result<Block> {
    let coinbase = Transaction::coinbase(
        b"genesis".to_vec(),
        Hash160::ZERO,
        params.block_reward,
        0,
    );
    BlockBuilder::new()
        .base_on(Hash256::ZERO, u32::MAX)
        .nbits(params.initial_nbits)
        .time(params.genesis_time)
        .add_transaction(coinbase)
        .build()
        .map_err(|e| anyhow!("cannot build genesis block: {}", e))
}

/// Difficulty a block at `height` must carry.
///
/// Height 0 uses the initial bits; a non-boundary height inherits its
/// parent's; a retarget boundary recomputes from the elapsed time across
/// the last interval.
pub fn expected_nbits(storage: &Storage, params: &ConsensusParams, height: u32) -> Result<u32> {
    if height == 0 {
        return Ok(params.initial_nbits);
    }
    let last = storage.index.require_record_at_height(height - 1)?;
    if height == 1 || height % params.retarget_interval != 1 {
        return Ok(last.header.nbits);
    }

    let anchor = storage
        .index
        .require_record_at_height(height - params.retarget_interval)?;
    let elapsed = last.header.time - anchor.header.time;
    retarget(
        anchor.header.nbits,
        elapsed,
        params.retarget_interval,
        params.expected_block_time,
        params.initial_nbits,
    )
    .map_err(|e| anyhow!("retarget failed at height {}: {}", height, e))
}

impl ConsensusEngine {
    pub fn new(
        storage: Arc<Storage>,
        mempool: Arc<Mempool>,
        params: ConsensusParams,
        block_file_size_limit: u64,
    ) -> Self {
        ConsensusEngine {
            storage,
            mempool,
            params,
            block_file_size_limit,
            branch: Mutex::new(Vec::new()),
            block_observers: Vec::new(),
            reorg_observers: Vec::new(),
            mining: Arc::new(Mutex::new(MiningContext {
                address: Hash160::ZERO,
                prev_hash: Hash256::ZERO,
                prev_height: 0,
                cancel: CancellationToken::new(),
            })),
        }
    }

    pub fn register_block_observer(&mut self, observer: Arc<dyn BlockObserver>) {
        self.block_observers.push(observer);
    }

    pub fn register_reorg_observer(&mut self, observer: Arc<dyn ReorgObserver>) {
        self.reorg_observers.push(observer);
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn mining_context(&self) -> Arc<Mutex<MiningContext>> {
        Arc::clone(&self.mining)
    }

    fn mining_lock(&self) -> MutexGuard<'_, MiningContext> {
        self.mining.lock().expect("mining context lock poisoned")
    }

    fn branch_lock(&self) -> MutexGuard<'_, Vec<Block>> {
        self.branch.lock().expect("orphan branch lock poisoned")
    }

    /// Points the miner at a new beneficiary and interrupts the current
    /// nonce search.
    pub fn set_miner_address(&self, address: Hash160) {
        let mut ctx = self.mining_lock();
        ctx.address = address;
        ctx.cancel.cancel();
        ctx.cancel = CancellationToken::new();
        info!(%address, "miner address updated");
    }

    /// The bounded ingress queue feeding [`ConsensusEngine::run`].
    pub fn block_queue() -> (mpsc::Sender<Block>, mpsc::Receiver<Block>) {
        mpsc::channel(BLOCK_QUEUE_CAPACITY)
    }

    /// Installs the genesis block on first start, or realigns the mining
    /// context with the persisted tip. Returns the tip hash.
    pub fn ensure_genesis(&self) -> Result<Hash256> {
        if let Some(tip) = self.storage.chain.tip()? {
            let record = self
                .storage
                .index
                .block_record(&tip)?
                .ok_or_else(|| anyhow!("tip {} has no index record", tip))?;
            let mut ctx = self.mining_lock();
            ctx.prev_hash = tip;
            ctx.prev_height = record.height;
            info!(%tip, height = record.height, "resuming at persisted tip");
            return Ok(tip);
        }

        let genesis = genesis_block(&self.params)?;
        // Self-built from fixed inputs; the wall-clock window does not
        // apply, and there is no parent to consult.
        self.connect_block(&genesis)
            .map_err(|e| anyhow!("cannot install genesis block: {}", e))?;
        info!(hash = %genesis.hash, "installed genesis block");
        Ok(genesis.hash)
    }

    /// Drains the ingress queue until the channel closes or a fatal
    /// integrity error stops the engine.
    pub async fn run(self: Arc<Self>, mut queue: mpsc::Receiver<Block>) -> Result<()> {
        info!("consensus engine started");
        while let Some(block) = queue.recv().await {
            let engine = Arc::clone(&self);
            // Acceptance is blocking disk work; keep it off the async
            // worker threads.
            let outcome = tokio::task::spawn_blocking(move || {
                let hash = block.hash;
                engine.handle_block(block).map(|d| (hash, d))
            })
            .await
            .context("engine worker panicked")?;

            match outcome {
                Ok((hash, disposition)) => {
                    debug!(%hash, ?disposition, "block processed")
                }
                Err(fatal) => {
                    error!("consensus engine aborting: {:#}", fatal);
                    return Err(fatal);
                }
            }
        }
        info!("consensus engine stopped");
        Ok(())
    }

    /// Applies the acceptance decision table to one inbound block.
    ///
    /// Consensus rejections are reported in the disposition, never as
    /// errors. `Err` means the store failed in a way that leaves the
    /// engine unable to continue (integrity failure mid-reorganization).
    pub fn handle_block(&self, block: Block) -> Result<BlockDisposition> {
        let tip = self
            .storage
            .chain
            .tip()?
            .ok_or_else(|| anyhow!("engine started without a tip"))?;

        let mut branch = self.branch_lock();
        if self.storage.index.has_block(&block.hash)?
            || branch.iter().any(|b| b.hash == block.hash)
        {
            debug!(hash = %block.hash, "dropping already known block");
            return Ok(BlockDisposition::Duplicate);
        }

        if block.header.prev_block_hash == tip {
            return Ok(match self.extend_tip(&block) {
                Ok(()) => BlockDisposition::ExtendedTip,
                Err(e) => {
                    if e.is_store_error() {
                        error!(hash = %block.hash, "acceptance aborted: {}", e);
                    } else {
                        warn!(hash = %block.hash, "rejecting block: {}", e);
                    }
                    BlockDisposition::Rejected(e)
                }
            });
        }

        if self.storage.index.has_block(&block.header.prev_block_hash)? {
            // Parent is on the chain but stale: this starts a candidate
            // branch, replacing any previous one.
            info!(
                hash = %block.hash,
                parent = %block.header.prev_block_hash,
                "block forks off a stale ancestor, tracking as new branch"
            );
            *branch = vec![block];
            return Ok(BlockDisposition::OrphanRoot);
        }

        if branch.last().map(|b| b.hash) == Some(block.header.prev_block_hash) {
            branch.push(block);
            let tip_record = self
                .storage
                .index
                .block_record(&tip)?
                .ok_or_else(|| anyhow!("tip {} has no index record", tip))?;
            let branch_tip_height = branch.last().map(|b| b.height).unwrap_or(0);
            if branch_tip_height <= tip_record.height {
                return Ok(BlockDisposition::OrphanExtended);
            }

            info!(
                branch_height = branch_tip_height,
                tip_height = tip_record.height,
                "branch overtakes active chain, reorganizing"
            );
            let candidate = std::mem::take(&mut *branch);
            return Ok(match self.reorganize(&candidate)? {
                Ok(()) => BlockDisposition::Reorganized,
                Err(e) => {
                    warn!("reorganization abandoned: {}", e);
                    BlockDisposition::Rejected(e)
                }
            });
        }

        debug!(
            hash = %block.hash,
            parent = %block.header.prev_block_hash,
            "dropping block with unknown parent"
        );
        Ok(BlockDisposition::Dropped)
    }

    /// Validates a transaction against the live UTXO set and admits it to
    /// the mempool.
    pub fn accept_transaction(
        &self,
        tx: Transaction,
    ) -> std::result::Result<u32, ConsensusError> {
        self.mempool.accept(tx, &self.storage.chain)
    }

    /// Validates `block` as the next tip and connects it.
    fn extend_tip(&self, block: &Block) -> std::result::Result<(), ConsensusError> {
        let store = |e: anyhow::Error| ConsensusError::Store(e.to_string());

        let prev = self
            .storage
            .index
            .block_record(&block.header.prev_block_hash)
            .map_err(store)?
            .ok_or_else(|| ConsensusError::Store("parent record disappeared".into()))?;
        if block.height != prev.height.wrapping_add(1) {
            return Err(ConsensusError::BadHeight);
        }

        let nbits = expected_nbits(&self.storage, &self.params, block.height).map_err(store)?;
        block.verify(
            &self.storage.chain,
            nbits,
            self.params.time_window,
            self.params.block_reward,
            unix_now(),
        )?;
        self.check_maturity(block)?;

        self.connect_block(block)
    }

    /// Persists a verified block: spends its inputs, creates its outputs,
    /// appends block and undo records, indexes everything, moves the tip,
    /// and fans out to observers after the commit.
    fn connect_block(&self, block: &Block) -> std::result::Result<(), ConsensusError> {
        let store = |e: anyhow::Error| ConsensusError::Store(e.to_string());

        let mut spent: Vec<Utxo> = Vec::new();
        let mut chain_ops: WriteOps = Vec::new();
        let mut index_ops: WriteOps = Vec::new();

        // Outputs created earlier in this same block; spendable by later
        // transactions before they ever reach the chain state. The write
        // set applies in order, so create-then-delete nets out correctly.
        let mut in_block: std::collections::HashMap<crate::consensus::utxo::OutPoint, Utxo> =
            std::collections::HashMap::new();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.ins {
                    let outpoint = input.outpoint();
                    let utxo = match self.storage.chain.utxo(&outpoint).map_err(store)? {
                        Some(utxo) => utxo,
                        None => in_block.remove(&outpoint).ok_or_else(|| {
                            // Verification saw this output an instant ago;
                            // its absence now means the store is broken.
                            ConsensusError::Store(format!(
                                "spent output {}:{} vanished during acceptance",
                                outpoint.txid, outpoint.vout
                            ))
                        })?,
                    };
                    chain_ops.push((chainstate::utxo_key(&outpoint), None));
                    spent.push(utxo);
                }
            }
            for utxo in tx.created_utxos() {
                in_block.insert(utxo.outpoint(), utxo.clone());
                chain_ops.push((
                    chainstate::utxo_key(&utxo.outpoint()),
                    Some(crate::codec::tx::encode_utxo(&utxo)),
                ));
            }
        }

        if let Some(new_id) = self
            .storage
            .rotate_if_needed(self.block_file_size_limit)
            .map_err(store)?
        {
            index_ops.push((
                blockindex::CURRENT_FILE_KEY.to_vec(),
                Some(new_id.to_le_bytes().to_vec()),
            ));
        }

        let appended = self.storage.append_block(block, &spent).map_err(store)?;

        index_ops.push((
            blockindex::block_key(&block.hash),
            Some(
                BlockIndexRecord {
                    header: block.header,
                    height: block.height,
                    tx_count: block.transactions.len() as u32,
                    file_id: appended.file_id,
                    offset: appended.offset,
                }
                .encode(),
            ),
        ));
        index_ops.push((
            blockindex::height_key(block.height),
            Some(block.hash.as_bytes().to_vec()),
        ));
        for (tx_offset, tx) in block.transactions.iter().enumerate() {
            index_ops.push((
                blockindex::tx_key(&tx.hash()),
                Some(
                    TransactionRecord {
                        file_id: appended.file_id,
                        block_offset: appended.offset,
                        tx_offset: tx_offset as u32,
                    }
                    .encode(),
                ),
            ));
        }
        index_ops.push((
            blockindex::file_key(appended.file_id),
            Some(appended.file_info.encode()),
        ));
        // The tip pointer is the last write of the acceptance.
        chain_ops.push((
            chainstate::TIP_KEY.to_vec(),
            Some(block.hash.as_bytes().to_vec()),
        ));

        self.commit(&index_ops, &chain_ops).map_err(store)?;
        self.storage.flush().map_err(store)?;

        info!(hash = %block.hash, height = block.height, "tip moved");

        {
            let mut ctx = self.mining_lock();
            ctx.prev_hash = block.hash;
            ctx.prev_height = block.height;
            ctx.cancel.cancel();
            ctx.cancel = CancellationToken::new();
        }

        for tx in &block.transactions {
            self.mempool.purge(&tx.hash());
        }
        for observer in &self.block_observers {
            observer.block_accepted(block);
        }
        Ok(())
    }

    /// Applies both write sets atomically across the index and chain
    /// trees.
    fn commit(&self, index_ops: &WriteOps, chain_ops: &WriteOps) -> Result<()> {
        let result: sled::transaction::TransactionResult<(), ()> =
            (&self.storage.index.tree, &self.storage.chain.tree).transaction(|(index, chain)| {
                for (key, value) in index_ops {
                    match value {
                        Some(bytes) => index.insert(key.as_slice(), bytes.as_slice())?,
                        None => index.remove(key.as_slice())?,
                    };
                }
                for (key, value) in chain_ops {
                    match value {
                        Some(bytes) => chain.insert(key.as_slice(), bytes.as_slice())?,
                        None => chain.remove(key.as_slice())?,
                    };
                }
                Ok(())
            });
        result.map_err(|e| anyhow!("store transaction failed: {:?}", e))
    }

    /// Rejects blocks that spend a coinbase output younger than the
    /// configured maturity window. Disabled at the default of zero.
    fn check_maturity(&self, block: &Block) -> std::result::Result<(), ConsensusError> {
        let maturity = self.params.coinbase_maturity;
        if maturity == 0 {
            return Ok(());
        }
        let store = |e: anyhow::Error| ConsensusError::Store(e.to_string());

        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for input in &tx.ins {
                let record = match self.storage.index.tx_record(&input.prev_txid).map_err(store)? {
                    Some(record) => record,
                    None => continue, // spends an in-block output
                };
                let source = self.storage.transaction_at(&record).map_err(store)?;
                if !source.is_coinbase() {
                    continue;
                }
                let created_in = self
                    .storage
                    .block_at(&BlockIndexRecord {
                        header: Default::default(),
                        height: 0,
                        tx_count: 0,
                        file_id: record.file_id,
                        offset: record.block_offset,
                    })
                    .map_err(store)?;
                if block.height.saturating_sub(created_in.height) < maturity {
                    return Err(ConsensusError::ImmatureSpend);
                }
            }
        }
        Ok(())
    }

    /// Replaces the active chain suffix with `branch`.
    ///
    /// Rolls back from the tip to the branch point (one store transaction
    /// per block, observers notified deepest-first), repoints the tip, and
    /// extends with the branch blocks in order. The rollback phase treats
    /// any missing record as a fatal integrity failure (`Err`); a branch
    /// block failing validation leaves a shorter consistent chain and is
    /// reported as `Ok(Err(_))`. Either way the mempool is stale
    /// afterwards and is cleared.
    fn reorganize(
        &self,
        branch: &[Block],
    ) -> Result<std::result::Result<(), ConsensusError>> {
        let branch_root_prev = branch
            .first()
            .map(|b| b.header.prev_block_hash)
            .ok_or_else(|| anyhow!("reorganization with empty branch"))?;

        let mut cursor = self
            .storage
            .chain
            .tip()?
            .ok_or_else(|| anyhow!("engine started without a tip"))?;

        while cursor != branch_root_prev {
            let record = self
                .storage
                .index
                .block_record(&cursor)?
                .ok_or_else(|| anyhow!("missing index record for {} during rollback", cursor))?;
            if record.height == 0 {
                return Err(anyhow!(
                    "rollback reached genesis without finding branch point {}",
                    branch_root_prev
                ));
            }
            let undo = self
                .storage
                .undo_at(record.file_id, record.offset)
                .with_context(|| format!("missing undo record for {}", cursor))?;
            let rolled_back = self
                .storage
                .block_at(&record)
                .with_context(|| format!("missing block body for {}", cursor))?;

            let mut index_ops: WriteOps = vec![
                (blockindex::block_key(&cursor), None),
                (blockindex::height_key(record.height), None),
            ];
            for tx in &rolled_back.transactions {
                index_ops.push((blockindex::tx_key(&tx.hash()), None));
            }
            let mut chain_ops: WriteOps = Vec::new();
            for utxo in &undo {
                chain_ops.push((
                    chainstate::utxo_key(&utxo.outpoint()),
                    Some(crate::codec::tx::encode_utxo(utxo)),
                ));
            }
            for tx in &rolled_back.transactions {
                for utxo in tx.created_utxos() {
                    chain_ops.push((chainstate::utxo_key(&utxo.outpoint()), None));
                }
            }
            self.commit(&index_ops, &chain_ops)?;

            info!(hash = %cursor, height = record.height, "rolled back block");
            for observer in &self.reorg_observers {
                observer.reorg_rollback(&rolled_back, &undo);
            }

            cursor = record.header.prev_block_hash;
        }

        self.storage.chain.set_tip(&branch_root_prev)?;
        {
            // Keep the miner off the rolled-back prefix while the branch
            // is applied.
            let mut ctx = self.mining_lock();
            ctx.cancel.cancel();
            ctx.cancel = CancellationToken::new();
        }

        for block in branch {
            if let Err(e) = self.extend_tip(block) {
                if e.is_store_error() {
                    self.mempool.clear();
                    return Err(anyhow!("store failed while applying branch: {}", e));
                }
                self.mempool.clear();
                return Ok(Err(e));
            }
        }

        self.mempool.clear();
        self.storage.flush()?;
        Ok(Ok(()))
    }
}
