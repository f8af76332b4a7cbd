//! Periodic peer discovery and block download tasks
//!
//! Discovery seeds the peer set from a configured address and keeps
//! absorbing `getaddr` answers. Block download runs only on non-mining
//! nodes: it offers recent locator hashes, picks the peer with the most
//! inventory beyond them, and funnels the fetched bodies through the
//! engine queue.

use crate::network::message::Inventory;
use crate::network::PeerContext;
use crate::types::Hash256;
use anyhow::Result;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds between block download rounds.
pub const BLOCK_DOWNLOAD_INTERVAL: u64 = 60;

/// Seconds between peer discovery rounds.
pub const PEER_DISCOVERY_INTERVAL: u64 = 60;

/// Locator depth offered to peers.
const LOCATOR_DEPTH: usize = 10;

/// Keeps the peer set populated, starting from `seed`.
pub async fn peer_discovery(ctx: PeerContext, seed: String) {
    info!(seed = seed.as_str(), "peer discovery started");
    ctx.network.add_peer(&seed);

    loop {
        for peer in ctx.network.peers() {
            match ctx.network.get_addr(&peer).await {
                Ok(addrs) => {
                    for addr in addrs {
                        ctx.network.add_peer(&addr);
                    }
                }
                Err(e) => debug!(peer = peer.as_str(), "getaddr failed: {}", e),
            }
        }
        tokio::time::sleep(Duration::from_secs(PEER_DISCOVERY_INTERVAL)).await;
    }
}

/// Periodically pulls missing blocks from the best-stocked peer.
pub async fn block_download(ctx: PeerContext) {
    info!("block download task started");
    loop {
        if let Err(e) = download_round(&ctx).await {
            warn!("block download round failed: {}", e);
        }
        tokio::time::sleep(Duration::from_secs(BLOCK_DOWNLOAD_INTERVAL)).await;
    }
}

/// Recent block hashes walking back from the tip, most recent first.
fn build_locator(ctx: &PeerContext) -> Result<Vec<Hash256>> {
    let mut locator = Vec::with_capacity(LOCATOR_DEPTH);
    let mut cursor = match ctx.storage.chain.tip()? {
        Some(tip) => tip,
        None => return Ok(locator),
    };
    for _ in 0..LOCATOR_DEPTH {
        locator.push(cursor);
        let record = match ctx.storage.index.block_record(&cursor)? {
            Some(record) => record,
            None => break,
        };
        if record.height == 0 {
            break;
        }
        cursor = record.header.prev_block_hash;
    }
    Ok(locator)
}

async fn download_round(ctx: &PeerContext) -> Result<()> {
    let locator = build_locator(ctx)?;
    if locator.is_empty() {
        return Ok(());
    }

    // Ask everyone, follow whoever knows the most.
    let mut best: Vec<Inventory> = Vec::new();
    let mut best_peer: Option<String> = None;
    for peer in ctx.network.peers() {
        match ctx
            .network
            .get_blocks(&peer, locator.clone(), Hash256::ZERO)
            .await
        {
            Ok(invs) if invs.len() > best.len() => {
                best = invs;
                best_peer = Some(peer);
            }
            Ok(_) => {}
            Err(e) => debug!(peer = peer.as_str(), "getblocks failed: {}", e),
        }
    }

    let peer = match best_peer {
        Some(peer) => peer,
        None => return Ok(()),
    };
    // The first inventory entry is the common block we already have.
    if best.len() <= 1 {
        debug!("chain is up to date");
        return Ok(());
    }

    let blocks = ctx.network.download_blocks(&peer, &best[1..]).await?;
    let count = blocks.len();
    for block in blocks {
        if ctx.block_queue.send(block).await.is_err() {
            return Ok(());
        }
    }
    if count > 0 {
        info!(count, peer = peer.as_str(), "downloaded blocks");
    }
    Ok(())
}
