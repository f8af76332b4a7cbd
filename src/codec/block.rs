//! Block header and block record encodings
//!
//! The header has a fixed 80-byte canonical form whose single SHA-256 is
//! the block hash:
//!
//! ```text
//! time i64 LE || nBits u32 LE || nonce u32 LE || prev_hash(32) || merkle_root(32)
//! ```
//!
//! Block records, as written to the segment files and the wire, carry the
//! height and the delimited transaction list:
//!
//! ```text
//! height u32 LE || prev_hash(32) || merkle_root(32) || time i64 LE
//! || nBits u32 LE || nonce u32 LE || tx_count u64 LE
//! || per tx: <tx bytes> || 0xefefefef
//! ```

use super::{tx, Malformed, Reader, Result, TX_DELIMITER};
use crate::consensus::block::{Block, BlockHeader};

/// Size of the canonical header encoding.
pub const HEADER_SIZE: usize = 80;

pub fn encode_header(header: &BlockHeader) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0..8].copy_from_slice(&header.time.to_le_bytes());
    out[8..12].copy_from_slice(&header.nbits.to_le_bytes());
    out[12..16].copy_from_slice(&header.nonce.to_le_bytes());
    out[16..48].copy_from_slice(header.prev_block_hash.as_bytes());
    out[48..80].copy_from_slice(header.merkle_root.as_bytes());
    out
}

pub fn read_header(r: &mut Reader<'_>) -> Result<BlockHeader> {
    let time = r.i64_le("header time")?;
    let nbits = r.u32_le("header nbits")?;
    let nonce = r.u32_le("header nonce")?;
    let prev_block_hash = r.hash256("header prev hash")?;
    let merkle_root = r.hash256("header merkle root")?;
    Ok(BlockHeader {
        time,
        nbits,
        nonce,
        prev_block_hash,
        merkle_root,
    })
}

pub fn decode_header(buf: &[u8]) -> Result<BlockHeader> {
    let mut r = Reader::new(buf);
    let header = read_header(&mut r)?;
    r.finish("header trailing bytes")?;
    Ok(header)
}

pub fn encode(block: &Block) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&block.height.to_le_bytes());
    out.extend_from_slice(block.header.prev_block_hash.as_bytes());
    out.extend_from_slice(block.header.merkle_root.as_bytes());
    out.extend_from_slice(&block.header.time.to_le_bytes());
    out.extend_from_slice(&block.header.nbits.to_le_bytes());
    out.extend_from_slice(&block.header.nonce.to_le_bytes());
    out.extend_from_slice(&(block.transactions.len() as u64).to_le_bytes());
    for transaction in &block.transactions {
        out.extend_from_slice(&tx::encode(transaction));
        out.extend_from_slice(&TX_DELIMITER);
    }
    out
}

/// Reads one block record, leaving the cursor after the last transaction
/// delimiter. The cached hash is recomputed from the decoded header.
pub fn read_block(r: &mut Reader<'_>) -> Result<Block> {
    let height = r.u32_le("block height")?;
    let prev_block_hash = r.hash256("block prev hash")?;
    let merkle_root = r.hash256("block merkle root")?;
    let time = r.i64_le("block time")?;
    let nbits = r.u32_le("block nbits")?;
    let nonce = r.u32_le("block nonce")?;
    let tx_count = r.u64_le("block tx count")?;
    if tx_count > r.remaining() as u64 {
        return Err(Malformed("block tx count"));
    }

    let mut transactions = Vec::with_capacity(tx_count as usize);
    for _ in 0..tx_count {
        transactions.push(tx::read_transaction(r)?);
        r.expect(&TX_DELIMITER, "block tx delimiter")?;
    }

    let header = BlockHeader {
        time,
        nbits,
        nonce,
        prev_block_hash,
        merkle_root,
    };
    Ok(Block {
        hash: header.hash(),
        height,
        header,
        transactions,
    })
}

pub fn decode(buf: &[u8]) -> Result<Block> {
    let mut r = Reader::new(buf);
    let block = read_block(&mut r)?;
    r.finish("block trailing bytes")?;
    Ok(block)
}
