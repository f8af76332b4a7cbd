//! Node orchestration
//!
//! Wires storage, wallet, mempool, engine, miner, network, and RPC
//! together and runs them as cooperating tasks:
//!
//! - one engine task draining the block queue,
//! - one miner task (mining nodes) or one block-download task (the rest),
//! - the P2P listener and the periodic peer-discovery task,
//! - the RPC server.

pub mod engine;
pub mod mempool;
pub mod miner;

use crate::config::NodeConfig;
use crate::network::{self, Network, PeerContext};
use crate::rpc::{RpcContext, RpcServer};
use crate::storage::Storage;
use crate::wallet::DiskWallet;
use anyhow::{Context, Result};
use engine::ConsensusEngine;
use mempool::Mempool;
use miner::Miner;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct Node {
    config: NodeConfig,
    storage: Arc<Storage>,
    mempool: Arc<Mempool>,
    wallet: Arc<DiskWallet>,
    network: Arc<Network>,
    engine: Arc<ConsensusEngine>,
}

impl Node {
    /// Builds the node, installing the genesis block on first start. Does
    /// not spawn any task yet.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        if config.clean_on_start && config.root_dir.exists() {
            info!(root = %config.root_dir.display(), "clean start: removing root directory");
            std::fs::remove_dir_all(&config.root_dir)
                .with_context(|| format!("cannot clean {}", config.root_dir.display()))?;
        }
        std::fs::create_dir_all(&config.root_dir)
            .with_context(|| format!("cannot create {}", config.root_dir.display()))?;

        let storage = Arc::new(Storage::open(&config.root_dir)?);
        let wallet = Arc::new(DiskWallet::open(&config.root_dir, config.rng_seed)?);
        let mempool = Arc::new(Mempool::new());
        let network = Arc::new(Network::new(&config.p2p_host, config.p2p_port));

        let mut engine = ConsensusEngine::new(
            Arc::clone(&storage),
            Arc::clone(&mempool),
            config.consensus.clone(),
            config.block_file_size_limit,
        );
        engine.register_block_observer(Arc::clone(&wallet) as _);
        engine.register_reorg_observer(Arc::clone(&wallet) as _);
        let engine = Arc::new(engine);

        engine.ensure_genesis()?;

        // The miner needs a beneficiary from the first round on.
        let miner_address = match wallet.list_addresses()?.first() {
            Some(address) => *address,
            None => wallet.new_address()?,
        };
        engine.set_miner_address(miner_address);

        Ok(Node {
            config,
            storage,
            mempool,
            wallet,
            network,
            engine,
        })
    }

    pub fn engine(&self) -> &Arc<ConsensusEngine> {
        &self.engine
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Spawns every task and parks until Ctrl-C or engine failure.
    pub async fn start(self) -> Result<()> {
        let (block_tx, block_rx) = ConsensusEngine::block_queue();

        let peer_ctx = PeerContext {
            storage: Arc::clone(&self.storage),
            mempool: Arc::clone(&self.mempool),
            network: Arc::clone(&self.network),
            block_queue: block_tx.clone(),
        };

        let mut engine_task = tokio::spawn(Arc::clone(&self.engine).run(block_rx));

        let listener_ctx = peer_ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = network::serve(listener_ctx).await {
                error!("p2p listener failed: {}", e);
            }
        });

        if let Some(seed) = self.config.seed_peer.clone() {
            tokio::spawn(network::sync::peer_discovery(peer_ctx.clone(), seed));
        }

        if self.config.enable_mining {
            let miner = Miner::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.mempool),
                self.config.consensus.clone(),
                self.engine.mining_context(),
                block_tx.clone(),
            );
            tokio::spawn(miner.run());
        } else {
            tokio::spawn(network::sync::block_download(peer_ctx.clone()));
        }

        let rpc = RpcServer::new(
            self.config.rpc_port,
            RpcContext {
                storage: Arc::clone(&self.storage),
                mempool: Arc::clone(&self.mempool),
                network: Arc::clone(&self.network),
                wallet: Arc::clone(&self.wallet),
                mining: self.engine.mining_context(),
            },
        );
        tokio::spawn(async move {
            if let Err(e) = rpc.run().await {
                error!("rpc server failed: {}", e);
            }
        });

        info!("node started");
        let mut failure = None;
        tokio::select! {
            outcome = &mut engine_task => {
                match outcome {
                    Ok(Ok(())) => warn!("engine stopped"),
                    Ok(Err(e)) => {
                        error!("engine aborted: {:#}", e);
                        failure = Some(e);
                    }
                    Err(e) => {
                        error!("engine task panicked: {}", e);
                        failure = Some(anyhow::anyhow!("engine task panicked: {}", e));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
            }
        }

        // Stop feeding the engine, then persist what we have.
        drop(block_tx);
        self.storage.flush()?;
        info!("node stopped");
        match failure {
            // An integrity failure needs an operator: exit non-zero so
            // supervision can resync from peers.
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
