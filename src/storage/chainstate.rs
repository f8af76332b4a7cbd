//! Chain state: the UTXO set and the tip pointer
//!
//! One sled tree with two key families: `C` + txid + vout for unspent
//! outputs, and the singleton `B` for the hash of the current tip. The
//! tree is the persistent [`UtxoView`] every validation runs against.

use crate::codec;
use crate::consensus::error::ConsensusError;
use crate::consensus::utxo::{OutPoint, Utxo, UtxoView};
use crate::types::Hash256;
use anyhow::Result;

pub(crate) fn utxo_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(37);
    key.push(b'C');
    key.extend_from_slice(outpoint.txid.as_bytes());
    key.extend_from_slice(&outpoint.vout.to_le_bytes());
    key
}

pub(crate) const TIP_KEY: &[u8] = b"B";

pub struct ChainState {
    pub(crate) tree: sled::Tree,
}

impl ChainState {
    pub fn new(tree: sled::Tree) -> Self {
        ChainState { tree }
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        match self.tree.get(utxo_key(outpoint))? {
            Some(bytes) => Ok(Some(codec::tx::decode_utxo(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_utxo(&self, utxo: &Utxo) -> Result<()> {
        self.tree
            .insert(utxo_key(&utxo.outpoint()), codec::tx::encode_utxo(utxo))?;
        Ok(())
    }

    pub fn remove_utxo(&self, outpoint: &OutPoint) -> Result<()> {
        self.tree.remove(utxo_key(outpoint))?;
        Ok(())
    }

    /// Every unspent output, for wallet rescans and tests.
    pub fn utxos(&self) -> Result<Vec<Utxo>> {
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix([b'C']) {
            let (_, bytes) = entry?;
            out.push(codec::tx::decode_utxo(&bytes)?);
        }
        Ok(out)
    }

    pub fn utxo_count(&self) -> Result<usize> {
        Ok(self.tree.scan_prefix([b'C']).count())
    }

    pub fn tip(&self) -> Result<Option<Hash256>> {
        Ok(self
            .tree
            .get(TIP_KEY)?
            .map(|bytes| Hash256::from_slice(&bytes)))
    }

    pub fn set_tip(&self, hash: &Hash256) -> Result<()> {
        self.tree.insert(TIP_KEY, hash.as_bytes().as_slice())?;
        Ok(())
    }
}

impl UtxoView for ChainState {
    fn utxo(&self, outpoint: &OutPoint) -> std::result::Result<Option<Utxo>, ConsensusError> {
        ChainState::utxo(self, outpoint).map_err(|e| ConsensusError::Store(e.to_string()))
    }
}
