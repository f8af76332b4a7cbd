//! Shared fixtures for integration tests: a headless node (storage +
//! mempool + engine) on a temporary root, with an easy difficulty so
//! nonce searches finish instantly, plus key and transaction helpers.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::SeedableRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use rustcoin::consensus::block::BlockBuilder;
use rustcoin::consensus::transaction::{pubkey_address, TransactionBuilder};
use rustcoin::consensus::utxo::UtxoOverlay;
use rustcoin::consensus::ConsensusParams;
use rustcoin::node::engine::{
    expected_nbits, BlockDisposition, BlockObserver, ConsensusEngine, ReorgObserver,
};
use rustcoin::node::mempool::Mempool;
use rustcoin::storage::blockindex::BlockIndexRecord;
use rustcoin::storage::Storage;
use rustcoin::types::unix_now;
use rustcoin::{Block, Hash160, Hash256, Transaction, Utxo};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Difficulty low enough that a block mines in a handful of hashes.
pub const EASY_BITS: u32 = 0x207f_ffff;

pub fn easy_params() -> ConsensusParams {
    ConsensusParams {
        initial_nbits: EASY_BITS,
        ..Default::default()
    }
}

/// Everything the engine notified, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    Accepted(Hash256),
    RolledBack(Hash256),
}

#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<ChainEvent>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<ChainEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl BlockObserver for Recorder {
    fn block_accepted(&self, block: &Block) {
        self.events
            .lock()
            .unwrap()
            .push(ChainEvent::Accepted(block.hash));
    }
}

impl ReorgObserver for Recorder {
    fn reorg_rollback(&self, block: &Block, _undo: &[Utxo]) {
        self.events
            .lock()
            .unwrap()
            .push(ChainEvent::RolledBack(block.hash));
    }
}

/// A node without its network tasks: blocks are handed straight to the
/// engine, exactly as the ingress dispatcher would.
pub struct TestNode {
    pub dir: TempDir,
    pub storage: Arc<Storage>,
    pub mempool: Arc<Mempool>,
    pub engine: Arc<ConsensusEngine>,
}

impl TestNode {
    pub fn new() -> TestNode {
        Self::build(easy_params(), 10 * 1024, None).0
    }

    pub fn with_params(params: ConsensusParams, file_limit: u64) -> TestNode {
        Self::build(params, file_limit, None).0
    }

    pub fn with_recorder() -> (TestNode, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let (node, _) = Self::build(easy_params(), 10 * 1024, Some(Arc::clone(&recorder)));
        (node, recorder)
    }

    fn build(
        params: ConsensusParams,
        file_limit: u64,
        recorder: Option<Arc<Recorder>>,
    ) -> (TestNode, Option<Arc<Recorder>>) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let mempool = Arc::new(Mempool::new());
        let mut engine = ConsensusEngine::new(
            Arc::clone(&storage),
            Arc::clone(&mempool),
            params,
            file_limit,
        );
        if let Some(recorder) = &recorder {
            engine.register_block_observer(Arc::clone(recorder) as _);
            engine.register_reorg_observer(Arc::clone(recorder) as _);
        }
        let engine = Arc::new(engine);
        engine.ensure_genesis().unwrap();
        (
            TestNode {
                dir,
                storage,
                mempool,
                engine,
            },
            recorder,
        )
    }

    pub fn tip(&self) -> Hash256 {
        self.storage.chain.tip().unwrap().unwrap()
    }

    pub fn tip_record(&self) -> BlockIndexRecord {
        self.storage
            .index
            .block_record(&self.tip())
            .unwrap()
            .unwrap()
    }

    /// Mines a block on the current tip paying `to`, including `txs`
    /// with a correctly funded coinbase.
    pub fn mine_block(&self, to: Hash160, txs: Vec<Transaction>) -> Block {
        let tip = self.tip_record();
        let height = tip.height + 1;
        let nbits =
            expected_nbits(&self.storage, self.engine.params(), height).unwrap();

        // Invalid transactions contribute no fee; the engine rejects the
        // block anyway, which some tests rely on.
        let mut overlay = UtxoOverlay::new(&self.storage.chain);
        let mut fee = 0u32;
        for tx in &txs {
            fee += tx.fee(&overlay).unwrap_or(0);
            overlay.apply(tx);
        }

        let coinbase = Transaction::coinbase(
            format!("cb@{}->{}", height, to).into_bytes(),
            to,
            self.engine.params().block_reward,
            fee,
        );
        let mut builder = BlockBuilder::new()
            .base_on(tip.hash(), tip.height)
            .nbits(nbits)
            .time(unix_now())
            .add_transaction(coinbase);
        for tx in txs {
            builder = builder.add_transaction(tx);
        }
        builder.build().unwrap()
    }

    pub fn submit(&self, block: Block) -> BlockDisposition {
        self.engine.handle_block(block).unwrap()
    }

    /// Mines and submits, asserting the block extends the tip.
    pub fn mine_to(&self, to: Hash160, txs: Vec<Transaction>) -> Block {
        let block = self.mine_block(to, txs);
        assert_eq!(self.submit(block.clone()), BlockDisposition::ExtendedTip);
        block
    }

    /// The full UTXO set, sorted for comparisons.
    pub fn utxos(&self) -> Vec<Utxo> {
        let mut utxos = self.storage.chain.utxos().unwrap();
        utxos.sort_by_key(|u| (u.txid, u.vout));
        utxos
    }
}

pub fn key(seed: u64) -> RsaPrivateKey {
    let mut rng = StdRng::seed_from_u64(seed);
    RsaPrivateKey::new(&mut rng, 512).unwrap()
}

pub fn address_of(key: &RsaPrivateKey) -> Hash160 {
    pubkey_address(&RsaPublicKey::from(key))
}

/// Signs a transfer spending `inputs` into `outputs`.
pub fn transfer(key: &RsaPrivateKey, inputs: Vec<Utxo>, outputs: Vec<(u32, Hash160)>) -> Transaction {
    let mut builder = TransactionBuilder::new();
    for utxo in inputs {
        builder = builder.add_input(utxo);
    }
    for (value, to) in outputs {
        builder = builder.add_output(value, to);
    }
    builder.sign(key).unwrap()
}
