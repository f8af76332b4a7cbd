//! Persistent storage: block/undo segments, block index, chain state
//!
//! All stores live under one root directory:
//!
//! ```text
//! <root>/data/blk_000000.dat, rev_000000.dat, ...   block/undo segments
//! <root>/db/                                        sled database
//! ```
//!
//! The index and chain-state trees share a single sled database so a block
//! acceptance can commit across both in one transaction. The block files
//! sit outside that transaction by design: a crash between the file append
//! and the commit leaves trailing bytes that segment replay truncates.

pub mod blockfile;
pub mod blockindex;
pub mod chainstate;

use crate::consensus::block::Block;
use crate::consensus::transaction::Transaction;
use crate::consensus::utxo::Utxo;
use anyhow::{anyhow, Context, Result};
use blockfile::BlockFile;
use blockindex::{BlockIndex, BlockIndexRecord, FileInfoRecord, TransactionRecord};
use chainstate::ChainState;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

/// Result of appending a block to the current segment.
pub struct AppendedBlock {
    pub file_id: u32,
    pub offset: u32,
    pub file_info: FileInfoRecord,
}

/// Storage manager owning the sled database and the current block segment.
pub struct Storage {
    root: PathBuf,
    db: sled::Db,
    pub index: BlockIndex,
    pub chain: ChainState,
    current: Mutex<BlockFile>,
}

impl Storage {
    /// Opens (or initializes) all stores under `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let data_dir = root.join("data");
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("cannot create {}", data_dir.display()))?;

        let db = sled::open(root.join("db")).context("cannot open database")?;
        let index = BlockIndex::new(db.open_tree("block_index")?);
        let chain = ChainState::new(db.open_tree("chain_state")?);

        let current_id = index.current_file_id()?.unwrap_or(0);
        let current = BlockFile::open(&data_dir, current_id)?;
        info!(
            file = current_id,
            blocks = current.block_count(),
            "opened block segment"
        );

        Ok(Storage {
            root: root.to_path_buf(),
            db,
            index,
            chain,
            current: Mutex::new(current),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn current(&self) -> MutexGuard<'_, BlockFile> {
        self.current.lock().expect("block file lock poisoned")
    }

    pub fn current_file_id(&self) -> u32 {
        self.current().id
    }

    /// Closes the current segment and opens the next when the block file
    /// has grown past `limit` bytes. Returns the new segment id.
    pub fn rotate_if_needed(&self, limit: u64) -> Result<Option<u32>> {
        let mut current = self.current();
        if current.blk_size() <= limit {
            return Ok(None);
        }
        let next_id = current.id + 1;
        info!(from = current.id, to = next_id, "rolling over block segment");
        *current = BlockFile::open(&self.data_dir(), next_id)?;
        Ok(Some(next_id))
    }

    /// Appends a block and its undo list to the current segment.
    pub fn append_block(&self, block: &Block, undo: &[Utxo]) -> Result<AppendedBlock> {
        let mut current = self.current();
        let offset = current.write_block(block, undo)?;
        Ok(AppendedBlock {
            file_id: current.id,
            offset,
            file_info: FileInfoRecord {
                block_count: current.block_count(),
                block_file_size: current.blk_size() as u32,
                undo_file_size: current.undo_size() as u32,
            },
        })
    }

    /// Loads the block a locator record points at, from the live segment
    /// cache or by replaying an older segment.
    pub fn block_at(&self, record: &BlockIndexRecord) -> Result<Block> {
        {
            let current = self.current();
            if current.id == record.file_id {
                return current
                    .block(record.offset)
                    .cloned()
                    .ok_or_else(|| anyhow!("block offset {} beyond segment", record.offset));
            }
        }
        let segment = BlockFile::open(&self.data_dir(), record.file_id)?;
        segment
            .block(record.offset)
            .cloned()
            .ok_or_else(|| anyhow!("block offset {} beyond segment {}", record.offset, record.file_id))
    }

    /// Loads the undo list recorded for a block.
    pub fn undo_at(&self, file_id: u32, offset: u32) -> Result<Vec<Utxo>> {
        {
            let current = self.current();
            if current.id == file_id {
                return current
                    .undo(offset)
                    .map(|u| u.to_vec())
                    .ok_or_else(|| anyhow!("undo offset {} beyond segment", offset));
            }
        }
        let segment = BlockFile::open(&self.data_dir(), file_id)?;
        segment
            .undo(offset)
            .map(|u| u.to_vec())
            .ok_or_else(|| anyhow!("undo offset {} beyond segment {}", offset, file_id))
    }

    /// Resolves a transaction through its locator record.
    pub fn transaction_at(&self, record: &TransactionRecord) -> Result<Transaction> {
        let block = self.block_at(&BlockIndexRecord {
            header: Default::default(),
            height: 0,
            tx_count: 0,
            file_id: record.file_id,
            offset: record.block_offset,
        })?;
        block
            .transactions
            .get(record.tx_offset as usize)
            .cloned()
            .ok_or_else(|| anyhow!("tx offset {} beyond block", record.tx_offset))
    }
}
