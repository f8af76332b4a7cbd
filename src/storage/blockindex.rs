//! Block index: locator records keyed by hash, height, txid and file id
//!
//! One sled tree holds four record families plus the current-file-id
//! singleton, distinguished by a one-byte key prefix:
//!
//! - `b` + block hash   → [`BlockIndexRecord`]
//! - `h` + height (BE)  → block hash
//! - `t` + txid         → [`TransactionRecord`]
//! - `f` + file id (BE) → [`FileInfoRecord`]
//! - `l`                → current file id
//!
//! `Ok(None)` is the not-found outcome; errors are real IO failures.

use crate::codec::{self, Reader};
use crate::consensus::block::BlockHeader;
use crate::types::Hash256;
use anyhow::{anyhow, Result};

/// Locates a block within the segment files, plus enough header context
/// to verify children without touching the block body.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockIndexRecord {
    pub header: BlockHeader,
    pub height: u32,
    pub tx_count: u32,
    pub file_id: u32,
    pub offset: u32,
}

impl BlockIndexRecord {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = codec::block::encode_header(&self.header).to_vec();
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.tx_count.to_le_bytes());
        out.extend_from_slice(&self.file_id.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> codec::Result<Self> {
        let mut r = Reader::new(buf);
        let header = codec::block::read_header(&mut r)?;
        let height = r.u32_le("index record height")?;
        let tx_count = r.u32_le("index record tx count")?;
        let file_id = r.u32_le("index record file id")?;
        let offset = r.u32_le("index record offset")?;
        r.finish("index record trailing bytes")?;
        Ok(BlockIndexRecord {
            header,
            height,
            tx_count,
            file_id,
            offset,
        })
    }
}

/// Locates a transaction within a stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionRecord {
    pub file_id: u32,
    pub block_offset: u32,
    pub tx_offset: u32,
}

impl TransactionRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.extend_from_slice(&self.file_id.to_le_bytes());
        out.extend_from_slice(&self.block_offset.to_le_bytes());
        out.extend_from_slice(&self.tx_offset.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> codec::Result<Self> {
        let mut r = Reader::new(buf);
        let file_id = r.u32_le("tx record file id")?;
        let block_offset = r.u32_le("tx record block offset")?;
        let tx_offset = r.u32_le("tx record tx offset")?;
        r.finish("tx record trailing bytes")?;
        Ok(TransactionRecord {
            file_id,
            block_offset,
            tx_offset,
        })
    }
}

/// Per-segment bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileInfoRecord {
    pub block_count: u32,
    pub block_file_size: u32,
    pub undo_file_size: u32,
}

impl FileInfoRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.extend_from_slice(&self.block_count.to_le_bytes());
        out.extend_from_slice(&self.block_file_size.to_le_bytes());
        out.extend_from_slice(&self.undo_file_size.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> codec::Result<Self> {
        let mut r = Reader::new(buf);
        let block_count = r.u32_le("file info block count")?;
        let block_file_size = r.u32_le("file info block size")?;
        let undo_file_size = r.u32_le("file info undo size")?;
        r.finish("file info trailing bytes")?;
        Ok(FileInfoRecord {
            block_count,
            block_file_size,
            undo_file_size,
        })
    }
}

pub(crate) fn block_key(hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'b');
    key.extend_from_slice(hash.as_bytes());
    key
}

pub(crate) fn height_key(height: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(b'h');
    key.extend_from_slice(&height.to_be_bytes());
    key
}

pub(crate) fn tx_key(txid: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b't');
    key.extend_from_slice(txid.as_bytes());
    key
}

pub(crate) fn file_key(id: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(b'f');
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub(crate) const CURRENT_FILE_KEY: &[u8] = b"l";

/// Repository over the block index tree.
pub struct BlockIndex {
    pub(crate) tree: sled::Tree,
}

impl BlockIndex {
    pub fn new(tree: sled::Tree) -> Self {
        BlockIndex { tree }
    }

    pub fn block_record(&self, hash: &Hash256) -> Result<Option<BlockIndexRecord>> {
        match self.tree.get(block_key(hash))? {
            Some(bytes) => Ok(Some(BlockIndexRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool> {
        Ok(self.tree.contains_key(block_key(hash))?)
    }

    pub fn block_hash_at_height(&self, height: u32) -> Result<Option<Hash256>> {
        Ok(self
            .tree
            .get(height_key(height))?
            .map(|bytes| Hash256::from_slice(&bytes)))
    }

    pub fn block_record_at_height(&self, height: u32) -> Result<Option<BlockIndexRecord>> {
        match self.block_hash_at_height(height)? {
            Some(hash) => self.block_record(&hash),
            None => Ok(None),
        }
    }

    /// Like [`block_record_at_height`] but treats a missing record as a
    /// broken index rather than a soft miss.
    ///
    /// [`block_record_at_height`]: BlockIndex::block_record_at_height
    pub fn require_record_at_height(&self, height: u32) -> Result<BlockIndexRecord> {
        self.block_record_at_height(height)?
            .ok_or_else(|| anyhow!("no block index record at height {}", height))
    }

    pub fn tx_record(&self, txid: &Hash256) -> Result<Option<TransactionRecord>> {
        match self.tree.get(tx_key(txid))? {
            Some(bytes) => Ok(Some(TransactionRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn file_info(&self, id: u32) -> Result<Option<FileInfoRecord>> {
        match self.tree.get(file_key(id))? {
            Some(bytes) => Ok(Some(FileInfoRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn current_file_id(&self) -> Result<Option<u32>> {
        Ok(self.tree.get(CURRENT_FILE_KEY)?.and_then(|bytes| {
            bytes
                .as_ref()
                .try_into()
                .ok()
                .map(|arr: [u8; 4]| u32::from_le_bytes(arr))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> BlockIndexRecord {
        BlockIndexRecord {
            header: BlockHeader {
                time: 1_700_000_123,
                nbits: 0x1e7f_ffff,
                nonce: 99,
                prev_block_hash: Hash256::from_slice(&[1; 32]),
                merkle_root: Hash256::from_slice(&[2; 32]),
            },
            height: 17,
            tx_count: 3,
            file_id: 2,
            offset: 5,
        }
    }

    #[test]
    fn test_block_record_round_trip() {
        let rec = sample_record();
        assert_eq!(BlockIndexRecord::decode(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn test_tx_record_round_trip() {
        let rec = TransactionRecord {
            file_id: 1,
            block_offset: 2,
            tx_offset: 3,
        };
        assert_eq!(TransactionRecord::decode(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn test_file_info_round_trip() {
        let rec = FileInfoRecord {
            block_count: 4,
            block_file_size: 9000,
            undo_file_size: 600,
        };
        assert_eq!(FileInfoRecord::decode(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn test_repo_operations() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let index = BlockIndex::new(db.open_tree("block_index").unwrap());
        let rec = sample_record();
        let hash = rec.hash();

        assert!(index.block_record(&hash).unwrap().is_none());
        index.tree.insert(block_key(&hash), rec.encode()).unwrap();
        index
            .tree
            .insert(height_key(rec.height), hash.as_bytes().as_slice())
            .unwrap();

        assert_eq!(index.block_record(&hash).unwrap().unwrap(), rec);
        assert_eq!(
            index.block_record_at_height(17).unwrap().unwrap().offset,
            rec.offset
        );
        assert!(index.has_block(&hash).unwrap());
        assert!(index.current_file_id().unwrap().is_none());
    }
}
