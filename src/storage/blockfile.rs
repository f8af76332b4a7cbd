//! Segmented block and undo files
//!
//! Segment `i` is the pair `blk_{i:06}.dat` / `rev_{i:06}.dat`, both
//! append-only. Every block record and every undo record ends with the
//! 8-byte magic delimiter; the k-th record in each file belongs to the
//! same block. On open both files are scanned record-wise into memory and
//! a partially written tail (no delimiter yet) is truncated away.

use crate::codec::{self, Reader, BLOCK_DELIMITER};
use crate::consensus::block::Block;
use crate::consensus::utxo::Utxo;
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

pub struct BlockFile {
    pub id: u32,
    blk: File,
    rev: File,
    blk_size: u64,
    undo_size: u64,
    blocks: Vec<Block>,
    undos: Vec<Vec<Utxo>>,
}

pub fn blk_path(data_dir: &Path, id: u32) -> PathBuf {
    data_dir.join(format!("blk_{:06}.dat", id))
}

pub fn rev_path(data_dir: &Path, id: u32) -> PathBuf {
    data_dir.join(format!("rev_{:06}.dat", id))
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open {}", path.display()))
}

impl BlockFile {
    /// Opens or creates segment `id`, replaying both files into memory.
    pub fn open(data_dir: &Path, id: u32) -> Result<Self> {
        let blk = open_append(&blk_path(data_dir, id))?;
        let rev = open_append(&rev_path(data_dir, id))?;

        let blk_bytes = std::fs::read(blk_path(data_dir, id))?;
        let (blocks, blk_good) = scan_blocks(&blk_bytes);
        if blk_good < blk_bytes.len() as u64 {
            warn!(
                file = id,
                discarded = blk_bytes.len() as u64 - blk_good,
                "discarding partial trailing block record"
            );
            blk.set_len(blk_good)?;
        }

        let rev_bytes = std::fs::read(rev_path(data_dir, id))?;
        let (undos, rev_good) = scan_undos(&rev_bytes);
        if rev_good < rev_bytes.len() as u64 {
            warn!(
                file = id,
                discarded = rev_bytes.len() as u64 - rev_good,
                "discarding partial trailing undo record"
            );
            rev.set_len(rev_good)?;
        }

        Ok(BlockFile {
            id,
            blk,
            rev,
            blk_size: blk_good,
            undo_size: rev_good,
            blocks,
            undos,
        })
    }

    /// Appends a block and its undo list as the segment's next record.
    /// Returns the record offset.
    pub fn write_block(&mut self, block: &Block, undo: &[Utxo]) -> Result<u32> {
        let mut blk_record = codec::block::encode(block);
        blk_record.extend_from_slice(&BLOCK_DELIMITER);
        self.blk
            .write_all(&blk_record)
            .with_context(|| format!("failed to write to block file {}", self.id))?;
        self.blk_size += blk_record.len() as u64;

        let mut rev_record = Vec::with_capacity(undo.len() * codec::tx::UTXO_SIZE + 8);
        for utxo in undo {
            rev_record.extend_from_slice(&codec::tx::encode_utxo(utxo));
        }
        rev_record.extend_from_slice(&BLOCK_DELIMITER);
        self.rev
            .write_all(&rev_record)
            .with_context(|| format!("failed to write to rev file {}", self.id))?;
        self.undo_size += rev_record.len() as u64;

        self.blocks.push(block.clone());
        self.undos.push(undo.to_vec());
        Ok((self.blocks.len() - 1) as u32)
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn blk_size(&self) -> u64 {
        self.blk_size
    }

    pub fn undo_size(&self) -> u64 {
        self.undo_size
    }

    pub fn block(&self, offset: u32) -> Option<&Block> {
        self.blocks.get(offset as usize)
    }

    pub fn undo(&self, offset: u32) -> Option<&[Utxo]> {
        self.undos.get(offset as usize).map(|u| u.as_slice())
    }
}

/// Decodes delimited block records from the front of `buf`. Returns the
/// records and the byte length of the valid prefix.
fn scan_blocks(buf: &[u8]) -> (Vec<Block>, u64) {
    let mut blocks = Vec::new();
    let mut good = 0usize;
    while good < buf.len() {
        let mut r = Reader::new(&buf[good..]);
        let block = match codec::block::read_block(&mut r) {
            Ok(block) => block,
            Err(_) => break,
        };
        if r.expect(&BLOCK_DELIMITER, "block record delimiter").is_err() {
            break;
        }
        good += r.position();
        blocks.push(block);
    }
    (blocks, good as u64)
}

/// Decodes delimited undo records: each is a run of fixed-size UTXO
/// encodings closed by the block delimiter.
fn scan_undos(buf: &[u8]) -> (Vec<Vec<Utxo>>, u64) {
    let mut undos = Vec::new();
    let mut good = 0usize;
    let mut pos = 0usize;
    'records: while pos < buf.len() {
        let mut utxos = Vec::new();
        loop {
            if buf.len() - pos >= 8 && buf[pos..pos + 8] == BLOCK_DELIMITER {
                pos += 8;
                undos.push(utxos);
                good = pos;
                continue 'records;
            }
            if buf.len() - pos < codec::tx::UTXO_SIZE {
                break 'records;
            }
            match codec::tx::decode_utxo(&buf[pos..pos + codec::tx::UTXO_SIZE]) {
                Ok(utxo) => utxos.push(utxo),
                Err(_) => break 'records,
            }
            pos += codec::tx::UTXO_SIZE;
        }
    }
    (undos, good as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::block::{Block, BlockHeader};
    use crate::consensus::transaction::Transaction;
    use crate::types::{Hash160, Hash256};
    use tempfile::TempDir;

    fn block(height: u32, tag: u8) -> Block {
        let cb = Transaction::coinbase(vec![tag], Hash160::from_slice(&[tag; 20]), 1000, 0);
        let header = BlockHeader {
            time: 1_700_000_000 + height as i64,
            nbits: 0x1e7f_ffff,
            nonce: height,
            prev_block_hash: Hash256::from_slice(&[tag; 32]),
            merkle_root: Hash256::ZERO,
        };
        Block {
            hash: header.hash(),
            height,
            header,
            transactions: vec![cb],
        }
    }

    fn utxo(tag: u8) -> Utxo {
        Utxo {
            txid: Hash256::from_slice(&[tag; 32]),
            vout: tag as u32,
            value: 100 + tag as u32,
            pubkey_hash: Hash160::from_slice(&[tag; 20]),
        }
    }

    #[test]
    fn test_write_then_reopen() {
        let dir = TempDir::new().unwrap();
        let b0 = block(0, 1);
        let b1 = block(1, 2);

        {
            let mut file = BlockFile::open(dir.path(), 0).unwrap();
            assert_eq!(file.write_block(&b0, &[]).unwrap(), 0);
            assert_eq!(file.write_block(&b1, &[utxo(7), utxo(8)]).unwrap(), 1);
        }

        let file = BlockFile::open(dir.path(), 0).unwrap();
        assert_eq!(file.block_count(), 2);
        assert_eq!(file.block(0).unwrap(), &b0);
        assert_eq!(file.block(1).unwrap(), &b1);
        assert_eq!(file.undo(0).unwrap(), &[]);
        assert_eq!(file.undo(1).unwrap(), &[utxo(7), utxo(8)]);
    }

    #[test]
    fn test_partial_trailing_block_discarded() {
        let dir = TempDir::new().unwrap();
        let b0 = block(0, 1);
        let full_size;
        {
            let mut file = BlockFile::open(dir.path(), 0).unwrap();
            file.write_block(&b0, &[]).unwrap();
            full_size = file.blk_size();
        }

        // Simulate a crash mid-append: valid record followed by garbage
        // without a delimiter.
        let path = blk_path(dir.path(), 0);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        std::fs::write(&path, &bytes).unwrap();

        let file = BlockFile::open(dir.path(), 0).unwrap();
        assert_eq!(file.block_count(), 1);
        assert_eq!(file.blk_size(), full_size);
        // The tail was truncated on disk, not just skipped.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), full_size);
    }

    #[test]
    fn test_partial_trailing_undo_discarded() {
        let dir = TempDir::new().unwrap();
        {
            let mut file = BlockFile::open(dir.path(), 0).unwrap();
            file.write_block(&block(0, 1), &[utxo(1)]).unwrap();
        }

        let path = rev_path(dir.path(), 0);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0x01; 10]);
        std::fs::write(&path, &bytes).unwrap();

        let file = BlockFile::open(dir.path(), 0).unwrap();
        assert_eq!(file.undo(0).unwrap(), &[utxo(1)]);
        assert_eq!(file.undos.len(), 1);
    }

    #[test]
    fn test_empty_segment() {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path(), 3).unwrap();
        assert_eq!(file.block_count(), 0);
        assert_eq!(file.blk_size(), 0);
    }
}
