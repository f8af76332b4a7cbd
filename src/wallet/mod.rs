//! Persisted wallet: RSA keys, owned UTXOs, balances
//!
//! The wallet keeps its own sled database under the shared root and never
//! reads consensus tables. Its view of the chain is built entirely from
//! engine callbacks: accepted blocks credit and debit owned outputs,
//! reorg rollbacks undo them using the block's undo list.

use crate::consensus::transaction::{pubkey_address, Transaction, TransactionBuilder};
use crate::consensus::utxo::{OutPoint, Utxo};
use crate::node::engine::{BlockObserver, ReorgObserver};
use crate::types::Hash160;
use crate::Block;
use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, error, info};

/// Bit length of generated keys. Small, like everything else on this
/// chain; the signing digest is 32 bytes and fits PKCS#1 v1.5 padding.
const KEY_BITS: usize = 512;

pub struct DiskWallet {
    #[allow(dead_code)]
    db: sled::Db,
    addresses: sled::Tree,
    keys: sled::Tree,
    balances: sled::Tree,
    utxos: sled::Tree,
    transactions: sled::Tree,
    rng: Mutex<StdRng>,
}

fn utxo_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(outpoint.txid.as_bytes());
    key.extend_from_slice(&outpoint.vout.to_le_bytes());
    key
}

impl DiskWallet {
    /// Opens or creates the wallet store under `root`. A seed makes key
    /// generation deterministic, for tests and reproducible setups.
    pub fn open(root: &Path, rng_seed: Option<i64>) -> Result<Self> {
        let db = sled::open(root.join("wallet")).context("cannot open wallet database")?;
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed as u64),
            None => StdRng::from_entropy(),
        };
        Ok(DiskWallet {
            addresses: db.open_tree("addresses")?,
            keys: db.open_tree("keys")?,
            balances: db.open_tree("balances")?,
            utxos: db.open_tree("utxos")?,
            transactions: db.open_tree("transactions")?,
            db,
            rng: Mutex::new(rng),
        })
    }

    /// Generates a fresh key pair and returns its address.
    pub fn new_address(&self) -> Result<Hash160> {
        let key = {
            let mut rng = self.rng.lock().expect("wallet rng lock poisoned");
            RsaPrivateKey::new(&mut *rng, KEY_BITS).context("key generation failed")?
        };
        let address = pubkey_address(&RsaPublicKey::from(&key));

        let der = key.to_pkcs1_der().context("cannot encode private key")?;
        self.addresses.insert(address.as_bytes(), &[][..])?;
        self.keys.insert(address.as_bytes(), der.as_bytes())?;
        info!(%address, "generated wallet address");
        Ok(address)
    }

    fn key_for(&self, address: &Hash160) -> Result<RsaPrivateKey> {
        let bytes = self
            .keys
            .get(address.as_bytes())?
            .ok_or_else(|| anyhow!("no key for address {}", address))?;
        RsaPrivateKey::from_pkcs1_der(&bytes).context("cannot decode private key")
    }

    pub fn owns(&self, address: &Hash160) -> Result<bool> {
        Ok(self.addresses.contains_key(address.as_bytes())?)
    }

    pub fn list_addresses(&self) -> Result<Vec<Hash160>> {
        let mut out = Vec::new();
        for entry in self.addresses.iter() {
            let (key, _) = entry?;
            out.push(Hash160::from_slice(&key));
        }
        Ok(out)
    }

    pub fn balance(&self, address: &Hash160) -> Result<u32> {
        Ok(self
            .balances
            .get(address.as_bytes())?
            .and_then(|bytes| bytes.as_ref().try_into().ok().map(u32::from_le_bytes))
            .unwrap_or(0))
    }

    pub fn balances(&self) -> Result<HashMap<Hash160, u32>> {
        let mut out = HashMap::new();
        for entry in self.balances.iter() {
            let (key, value) = entry?;
            let balance = value
                .as_ref()
                .try_into()
                .ok()
                .map(u32::from_le_bytes)
                .unwrap_or(0);
            out.insert(Hash160::from_slice(&key), balance);
        }
        Ok(out)
    }

    fn adjust_balance(&self, address: &Hash160, delta: i64) -> Result<()> {
        let updated = (self.balance(address)? as i64 + delta).max(0) as u32;
        self.balances
            .insert(address.as_bytes(), updated.to_le_bytes().to_vec())?;
        Ok(())
    }

    pub fn list_unspent(&self, address: &Hash160) -> Result<Vec<Utxo>> {
        let mut out = Vec::new();
        for entry in self.utxos.iter() {
            let (_, value) = entry?;
            let utxo = crate::codec::tx::decode_utxo(&value)?;
            if &utxo.pubkey_hash == address {
                out.push(utxo);
            }
        }
        Ok(out)
    }

    pub fn list_transactions(&self) -> Result<Vec<Transaction>> {
        let mut out = Vec::new();
        for entry in self.transactions.iter() {
            let (_, value) = entry?;
            out.push(crate::codec::tx::decode(&value)?);
        }
        Ok(out)
    }

    /// Builds and signs a payment of `amount` from one owned address,
    /// spending owned UTXOs and returning change minus `fee` to the
    /// sender.
    pub fn create_transaction(
        &self,
        from: &Hash160,
        to: &Hash160,
        amount: u32,
        fee: u32,
    ) -> Result<Transaction> {
        let key = self.key_for(from)?;
        let needed = amount as u64 + fee as u64;

        let mut builder = TransactionBuilder::new();
        for utxo in self.list_unspent(from)? {
            if builder.input_value() >= needed {
                break;
            }
            builder = builder.add_input(utxo);
        }
        let collected = builder.input_value();
        if collected < needed {
            return Err(anyhow!(
                "insufficient funds: have {}, need {}",
                collected,
                needed
            ));
        }

        builder = builder.add_output(amount, *to);
        let change = collected - needed;
        if change > 0 {
            builder = builder.add_output(change as u32, *from);
        }
        builder.sign(&key)
    }

    /// Applies one confirmed transaction: spends owned inputs, credits
    /// owned outputs. Records the transaction when it touched the wallet.
    fn process_transaction(&self, tx: &Transaction) -> Result<()> {
        let txid = tx.hash();
        let mut relevant = false;

        if !tx.is_coinbase() {
            for input in &tx.ins {
                let key = utxo_key(&input.outpoint());
                if let Some(bytes) = self.utxos.get(&key)? {
                    let spent = crate::codec::tx::decode_utxo(&bytes)?;
                    self.utxos.remove(&key)?;
                    self.adjust_balance(&spent.pubkey_hash, -(spent.value as i64))?;
                    relevant = true;
                }
            }
        }

        for utxo in tx.created_utxos() {
            if self.owns(&utxo.pubkey_hash)? {
                self.utxos.insert(
                    utxo_key(&utxo.outpoint()),
                    crate::codec::tx::encode_utxo(&utxo),
                )?;
                self.adjust_balance(&utxo.pubkey_hash, utxo.value as i64)?;
                relevant = true;
            }
        }

        if relevant {
            self.transactions
                .insert(txid.as_bytes(), crate::codec::tx::encode(tx))?;
            debug!(%txid, "wallet recorded transaction");
        }
        Ok(())
    }

    /// Scans an accepted block for wallet-relevant transactions.
    pub fn process_block(&self, block: &Block) -> Result<()> {
        for tx in &block.transactions {
            self.process_transaction(tx)?;
        }
        Ok(())
    }

    /// Reverses a rolled-back block: forgets its outputs, restores owned
    /// outputs it had spent.
    pub fn roll_back(&self, block: &Block, undo: &[Utxo]) -> Result<()> {
        for tx in &block.transactions {
            let txid = tx.hash();
            for utxo in tx.created_utxos() {
                let key = utxo_key(&utxo.outpoint());
                if self.utxos.get(&key)?.is_some() {
                    self.utxos.remove(&key)?;
                    self.adjust_balance(&utxo.pubkey_hash, -(utxo.value as i64))?;
                }
            }
            self.transactions.remove(txid.as_bytes())?;
        }

        for utxo in undo {
            if self.owns(&utxo.pubkey_hash)? {
                self.utxos.insert(
                    utxo_key(&utxo.outpoint()),
                    crate::codec::tx::encode_utxo(utxo),
                )?;
                self.adjust_balance(&utxo.pubkey_hash, utxo.value as i64)?;
            }
        }
        Ok(())
    }
}

impl BlockObserver for DiskWallet {
    fn block_accepted(&self, block: &Block) {
        if let Err(e) = self.process_block(block) {
            error!(hash = %block.hash, "wallet failed to process block: {}", e);
        }
    }
}

impl ReorgObserver for DiskWallet {
    fn reorg_rollback(&self, block: &Block, undo: &[Utxo]) {
        if let Err(e) = self.roll_back(block, undo) {
            error!(hash = %block.hash, "wallet failed to roll back block: {}", e);
        }
    }
}
