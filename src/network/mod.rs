//! Peer-to-peer layer: peer registry, gossip, and the inbound listener
//!
//! Peer handlers never touch consensus state directly: inbound blocks go
//! through the engine's bounded queue (blocking the handler when
//! consensus lags behind the network), inbound transactions go to the
//! mempool under its own lock. Outbound requests open one TCP connection
//! per exchange.

pub mod message;
pub mod sync;

use crate::consensus::block::Block;
use crate::consensus::transaction::Transaction;
use crate::node::mempool::Mempool;
use crate::storage::Storage;
use crate::types::Hash256;
use anyhow::{anyhow, Context, Result};
use message::{GetBlocksMsg, Inventory};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Per-exchange network timeout.
const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Known-peer registry and outbound messaging.
pub struct Network {
    listen_addr: String,
    peers: Mutex<HashSet<String>>,
}

impl Network {
    pub fn new(host: &str, port: u16) -> Self {
        Network {
            listen_addr: format!("{}:{}", host, port),
            peers: Mutex::new(HashSet::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.listen_addr
    }

    fn peers_lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.peers.lock().expect("peer set lock poisoned")
    }

    /// Registers a peer address. Returns true when it was new.
    pub fn add_peer(&self, addr: &str) -> bool {
        if addr == self.listen_addr {
            return false;
        }
        let added = self.peers_lock().insert(addr.to_string());
        if added {
            info!(peer = addr, "added peer");
        }
        added
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers_lock().iter().cloned().collect()
    }

    /// Addresses shared with other nodes: every known peer plus our own.
    pub fn known_addrs(&self) -> Vec<String> {
        let mut addrs = self.peers();
        addrs.push(self.listen_addr.clone());
        addrs
    }

    async fn connect(&self, peer: &str) -> Result<TcpStream> {
        tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", peer))?
            .with_context(|| format!("cannot connect to {}", peer))
    }

    /// One request/response exchange: send `command`, await one reply.
    async fn request(&self, peer: &str, command: &str, payload: &[u8]) -> Result<(String, Vec<u8>)> {
        let mut stream = self.connect(peer).await?;
        message::write_message(&mut stream, command, payload).await?;
        tokio::time::timeout(IO_TIMEOUT, message::read_message(&mut stream))
            .await
            .map_err(|_| anyhow!("{} response from {} timed out", command, peer))?
    }

    /// One-way send with no reply expected.
    async fn send(&self, peer: &str, command: &str, payload: &[u8]) -> Result<()> {
        let mut stream = self.connect(peer).await?;
        message::write_message(&mut stream, command, payload).await
    }

    /// Asks a peer for its known addresses.
    pub async fn get_addr(&self, peer: &str) -> Result<Vec<String>> {
        let (command, payload) = self.request(peer, message::CMD_GETADDR, &[]).await?;
        if command != message::CMD_ADDR {
            return Err(anyhow!("unexpected {} reply to getaddr", command));
        }
        Ok(message::decode_addrs(&payload)?)
    }

    /// Asks a peer which blocks follow our locator. Returns its inventory,
    /// oldest first, starting at the most recent common block.
    pub async fn get_blocks(
        &self,
        peer: &str,
        locator: Vec<Hash256>,
        stop: Hash256,
    ) -> Result<Vec<Inventory>> {
        let payload = message::encode_get_blocks(&GetBlocksMsg { locator, stop });
        let (command, payload) = self.request(peer, message::CMD_GETBLOCKS, &payload).await?;
        if command != message::CMD_INV {
            return Err(anyhow!("unexpected {} reply to getblocks", command));
        }
        Ok(message::decode_inventories(&payload)?)
    }

    /// Fetches full blocks for an inventory list, in order.
    pub async fn download_blocks(&self, peer: &str, invs: &[Inventory]) -> Result<Vec<Block>> {
        if invs.is_empty() {
            return Ok(Vec::new());
        }
        let mut stream = self.connect(peer).await?;
        message::write_message(
            &mut stream,
            message::CMD_GETDATA,
            &message::encode_inventories(invs),
        )
        .await?;

        let mut blocks = Vec::with_capacity(invs.len());
        for _ in invs {
            let (command, payload) =
                tokio::time::timeout(IO_TIMEOUT, message::read_message(&mut stream))
                    .await
                    .map_err(|_| anyhow!("block download from {} timed out", peer))??;
            if command != message::CMD_BLOCK {
                return Err(anyhow!("unexpected {} during block download", command));
            }
            blocks.push(crate::codec::block::decode(&payload)?);
        }
        Ok(blocks)
    }

    /// Announces a block to every known peer except `origin`.
    pub async fn broadcast_block(&self, block: &Block, origin: Option<&str>) {
        let payload = crate::codec::block::encode(block);
        for peer in self.peers() {
            if Some(peer.as_str()) == origin {
                continue;
            }
            if let Err(e) = self.send(&peer, message::CMD_BLOCK, &payload).await {
                debug!(peer = peer.as_str(), "block broadcast failed: {}", e);
            }
        }
    }

    /// Announces a transaction to every known peer except `origin`.
    pub async fn broadcast_tx(&self, tx: &Transaction, origin: Option<&str>) {
        let payload = crate::codec::tx::encode(tx);
        for peer in self.peers() {
            if Some(peer.as_str()) == origin {
                continue;
            }
            if let Err(e) = self.send(&peer, message::CMD_TX, &payload).await {
                debug!(peer = peer.as_str(), "tx broadcast failed: {}", e);
            }
        }
    }
}

/// Everything a peer handler may touch.
#[derive(Clone)]
pub struct PeerContext {
    pub storage: Arc<Storage>,
    pub mempool: Arc<Mempool>,
    pub network: Arc<Network>,
    pub block_queue: mpsc::Sender<Block>,
}

/// Accept loop for inbound peer connections.
pub async fn serve(ctx: PeerContext) -> Result<()> {
    let listener = TcpListener::bind(ctx.network.address())
        .await
        .with_context(|| format!("cannot listen on {}", ctx.network.address()))?;
    info!(addr = ctx.network.address(), "p2p listener started");

    loop {
        let (stream, remote) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx).await {
                debug!(peer = %remote, "peer connection ended: {}", e);
            }
        });
    }
}

/// Reads one message from an inbound connection and dispatches it.
async fn handle_connection(mut stream: TcpStream, ctx: PeerContext) -> Result<()> {
    let (command, payload) =
        tokio::time::timeout(IO_TIMEOUT, message::read_message(&mut stream)).await??;

    match command.as_str() {
        message::CMD_GETADDR => handle_getaddr(&mut stream, &ctx).await,
        message::CMD_GETBLOCKS => handle_getblocks(&mut stream, &ctx, &payload).await,
        message::CMD_GETDATA => handle_getdata(&mut stream, &ctx, &payload).await,
        message::CMD_BLOCK => handle_block(&ctx, &payload).await,
        message::CMD_TX => handle_tx(&ctx, &payload).await,
        other => {
            // Unknown command: drop the message, keep the peer.
            warn!(command = other, "ignoring unknown command");
            Ok(())
        }
    }
}

async fn handle_getaddr(stream: &mut TcpStream, ctx: &PeerContext) -> Result<()> {
    let addrs = ctx.network.known_addrs();
    message::write_message(stream, message::CMD_ADDR, &message::encode_addrs(&addrs)).await
}

async fn handle_getblocks(
    stream: &mut TcpStream,
    ctx: &PeerContext,
    payload: &[u8],
) -> Result<()> {
    let msg = message::decode_get_blocks(payload)?;

    // Most recent common block between the peer's locator and our chain.
    let mut common = None;
    for hash in &msg.locator {
        if let Some(record) = ctx.storage.index.block_record(hash)? {
            common = Some(record);
            break;
        }
    }
    let mut record = match common {
        Some(record) => record,
        None => {
            debug!("peer asked for blocks we do not have");
            return Ok(());
        }
    };

    let tip = ctx
        .storage
        .chain
        .tip()?
        .ok_or_else(|| anyhow!("node has no tip"))?;

    // Walk forward by height from the common block to the stop hash or
    // our tip, oldest first.
    let mut invs = Vec::new();
    loop {
        let hash = record.hash();
        invs.push(Inventory {
            type_id: message::INV_BLOCK,
            hash,
        });
        if hash == msg.stop || hash == tip {
            break;
        }
        record = match ctx.storage.index.block_record_at_height(record.height + 1)? {
            Some(next) => next,
            None => break,
        };
    }

    debug!(count = invs.len(), "answering getblocks");
    message::write_message(
        stream,
        message::CMD_INV,
        &message::encode_inventories(&invs),
    )
    .await
}

async fn handle_getdata(stream: &mut TcpStream, ctx: &PeerContext, payload: &[u8]) -> Result<()> {
    let invs = message::decode_inventories(payload)?;
    for inv in invs {
        if inv.type_id != message::INV_BLOCK {
            continue;
        }
        let record = match ctx.storage.index.block_record(&inv.hash)? {
            Some(record) => record,
            None => {
                debug!(hash = %inv.hash, "peer requested unknown block");
                continue;
            }
        };
        let block = ctx.storage.block_at(&record)?;
        message::write_message(
            stream,
            message::CMD_BLOCK,
            &crate::codec::block::encode(&block),
        )
        .await?;
        debug!(hash = %inv.hash, height = block.height, "served block");
    }
    Ok(())
}

async fn handle_block(ctx: &PeerContext, payload: &[u8]) -> Result<()> {
    let block = match crate::codec::block::decode(payload) {
        Ok(block) => block,
        Err(e) => {
            // Malformed gossip is dropped at the boundary.
            warn!("dropping malformed block message: {}", e);
            return Ok(());
        }
    };
    info!(hash = %block.hash, height = block.height, "received block");

    if ctx.storage.index.has_block(&block.hash)? {
        debug!(hash = %block.hash, "already have block");
        return Ok(());
    }

    // Enqueue first (backpressure throttles us to consensus speed), then
    // relay. The engine drops duplicates, so relay loops die out at the
    // already-have check above.
    let relayed = block.clone();
    ctx.block_queue
        .send(block)
        .await
        .map_err(|_| anyhow!("engine queue closed"))?;

    let network = Arc::clone(&ctx.network);
    tokio::spawn(async move {
        network.broadcast_block(&relayed, None).await;
    });
    Ok(())
}

async fn handle_tx(ctx: &PeerContext, payload: &[u8]) -> Result<()> {
    let tx = match crate::codec::tx::decode(payload) {
        Ok(tx) => tx,
        Err(e) => {
            warn!("dropping malformed tx message: {}", e);
            return Ok(());
        }
    };
    let txid = tx.hash();
    if ctx.mempool.contains(&txid) {
        return Ok(());
    }

    match ctx.mempool.accept(tx.clone(), &ctx.storage.chain) {
        Ok(_) => {
            let network = Arc::clone(&ctx.network);
            tokio::spawn(async move {
                network.broadcast_tx(&tx, None).await;
            });
        }
        Err(e) if e.is_store_error() => error!(%txid, "tx acceptance failed: {}", e),
        Err(e) => debug!(%txid, "rejecting tx: {}", e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_registry_excludes_self() {
        let network = Network::new("127.0.0.1", 9333);
        assert!(!network.add_peer("127.0.0.1:9333"));
        assert!(network.add_peer("10.0.0.1:9333"));
        assert!(!network.add_peer("10.0.0.1:9333"));
        assert_eq!(network.peers().len(), 1);
        assert_eq!(network.known_addrs().len(), 2);
    }
}
