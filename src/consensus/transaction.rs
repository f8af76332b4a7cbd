//! Transaction model and verification
//!
//! A transaction is an ordered list of inputs and outputs. Every
//! non-coinbase input embeds the sender's RSA public key and a PKCS#1 v1.5
//! signature over the transaction's signing digest; outputs lock value to a
//! 160-bit public key hash. The coinbase transaction has exactly one
//! synthetic input carrying arbitrary bytes instead of a script.

use crate::consensus::error::{ConsensusError, Result};
use crate::consensus::utxo::{require_utxo, OutPoint, Utxo, UtxoView};
use crate::types::{double_sha256, hash160, sha256, Hash160, Hash256};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

/// Sentinel output index used by the coinbase input.
pub const COINBASE_VOUT: u32 = u32::MAX;

/// Unlocking data for a non-coinbase input.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptSig {
    pub pubkey: RsaPublicKey,
    pub signature: Vec<u8>,
}

/// What an input presents to spend its referenced output.
#[derive(Debug, Clone, PartialEq)]
pub enum Unlock {
    /// Arbitrary bytes; only valid on the coinbase sentinel input.
    Coinbase(Vec<u8>),
    /// Public key plus signature over the signing digest.
    Script(ScriptSig),
}

/// Transaction input.
#[derive(Debug, Clone, PartialEq)]
pub struct TxIn {
    pub prev_txid: Hash256,
    pub vout: u32,
    pub unlock: Unlock,
}

impl TxIn {
    pub fn coinbase(data: Vec<u8>) -> Self {
        TxIn {
            prev_txid: Hash256::ZERO,
            vout: COINBASE_VOUT,
            unlock: Unlock::Coinbase(data),
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.prev_txid, self.vout)
    }
}

/// Transaction output: value locked to a public key hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOut {
    pub value: u32,
    pub pubkey_hash: Hash160,
}

/// A transfer of value between unspent outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub ins: Vec<TxIn>,
    pub outs: Vec<TxOut>,
}

/// Canonical bytes a public key contributes to hashing: modulus big-endian,
/// then the exponent as eight little-endian bytes.
pub fn pubkey_bytes(pubkey: &RsaPublicKey) -> Vec<u8> {
    use rsa::traits::PublicKeyParts;
    let mut out = pubkey.n().to_bytes_be();
    let mut exponent = [0u8; 8];
    let e = pubkey.e().to_bytes_le();
    let n = e.len().min(8);
    exponent[..n].copy_from_slice(&e[..n]);
    out.extend_from_slice(&exponent);
    out
}

/// Address of a public key: RIPEMD160(SHA256(canonical key bytes)).
pub fn pubkey_address(pubkey: &RsaPublicKey) -> Hash160 {
    hash160(&pubkey_bytes(pubkey))
}

impl Transaction {
    /// Builds a coinbase paying `reward + fee` to `to`.
    pub fn coinbase(data: Vec<u8>, to: Hash160, reward: u32, fee: u32) -> Self {
        Transaction {
            ins: vec![TxIn::coinbase(data)],
            outs: vec![TxOut {
                value: reward.saturating_add(fee),
                pubkey_hash: to,
            }],
        }
    }

    /// Transaction id: SHA-256 over the canonical encoding.
    pub fn hash(&self) -> Hash256 {
        sha256(&crate::codec::tx::encode(self))
    }

    /// A transaction is coinbase iff it has exactly one input and that
    /// input is the all-zero sentinel.
    pub fn is_coinbase(&self) -> bool {
        self.ins.len() == 1
            && self.ins[0].prev_txid.is_zero()
            && matches!(self.ins[0].unlock, Unlock::Coinbase(_))
    }

    /// Sum of output values; `None` on u32 overflow.
    pub fn output_sum(&self) -> Option<u32> {
        self.outs
            .iter()
            .try_fold(0u32, |acc, out| acc.checked_add(out.value))
    }

    /// Digest signed by input `k`, spending an output locked to
    /// `pubkey_hash`: every input's `(prev_txid, vout)` with the key hash
    /// interpolated at position `k`, followed by every output's
    /// `(pubkey_hash, value)`, double-hashed.
    pub fn signing_digest(&self, k: usize, pubkey_hash: &Hash160) -> Hash256 {
        let mut data = Vec::new();
        for (i, input) in self.ins.iter().enumerate() {
            data.extend_from_slice(input.prev_txid.as_bytes());
            data.extend_from_slice(&input.vout.to_le_bytes());
            if i == k {
                data.extend_from_slice(pubkey_hash.as_bytes());
            }
        }
        for out in &self.outs {
            data.extend_from_slice(out.pubkey_hash.as_bytes());
            data.extend_from_slice(&out.value.to_le_bytes());
        }
        double_sha256(&data)
    }

    /// Fee left to the miner: input value minus output value. Coinbase
    /// transactions carry no fee.
    pub fn fee(&self, view: &dyn UtxoView) -> Result<u32> {
        if self.is_coinbase() {
            return Ok(0);
        }
        let out_sum = self.output_sum().ok_or(ConsensusError::OverSpend)? as u64;
        let mut in_sum = 0u64;
        for input in &self.ins {
            in_sum += require_utxo(view, &input.outpoint())?.value as u64;
        }
        if out_sum > in_sum {
            return Err(ConsensusError::OverSpend);
        }
        u32::try_from(in_sum - out_sum).map_err(|_| ConsensusError::OverSpend)
    }

    /// Validates the transaction against a UTXO view.
    ///
    /// Checks, in order: non-empty input and output lists; coinbase shape
    /// (or a single consistent sender across all inputs); existence of
    /// every referenced output; that each embedded key hashes to the
    /// output's key hash; each input's signature; and that outputs do not
    /// exceed inputs. Coinbase value is bounded at the block level instead.
    pub fn verify(&self, view: &dyn UtxoView) -> Result<()> {
        if self.ins.is_empty() || self.outs.is_empty() {
            return Err(ConsensusError::Empty);
        }

        if self.is_coinbase() {
            match &self.ins[0].unlock {
                Unlock::Coinbase(data) if !data.is_empty() => {}
                _ => return Err(ConsensusError::Empty),
            }
        } else {
            let mut sender: Option<Hash160> = None;
            for input in &self.ins {
                let script = match &input.unlock {
                    Unlock::Script(script) => script,
                    // A sentinel input outside a proper coinbase references
                    // an output that cannot exist.
                    Unlock::Coinbase(_) => {
                        return Err(ConsensusError::MissingInput {
                            txid: input.prev_txid,
                            vout: input.vout,
                        })
                    }
                };
                let address = pubkey_address(&script.pubkey);
                match sender {
                    None => sender = Some(address),
                    Some(first) if first != address => {
                        return Err(ConsensusError::MultipleSenders)
                    }
                    Some(_) => {}
                }
            }

            for (k, input) in self.ins.iter().enumerate() {
                let script = match &input.unlock {
                    Unlock::Script(script) => script,
                    Unlock::Coinbase(_) => unreachable!("checked above"),
                };
                let utxo = require_utxo(view, &input.outpoint())?;
                if pubkey_address(&script.pubkey) != utxo.pubkey_hash {
                    return Err(ConsensusError::WrongKey);
                }
                let digest = self.signing_digest(k, &utxo.pubkey_hash);
                script
                    .pubkey
                    .verify(
                        Pkcs1v15Sign::new::<Sha256>(),
                        digest.as_bytes(),
                        &script.signature,
                    )
                    .map_err(|_| ConsensusError::BadSignature)?;
            }
        }

        let out_sum = self.output_sum().ok_or(ConsensusError::OverSpend)? as u64;
        if !self.is_coinbase() {
            let mut in_sum = 0u64;
            for input in &self.ins {
                in_sum += require_utxo(view, &input.outpoint())?.value as u64;
            }
            if out_sum > in_sum {
                return Err(ConsensusError::OverSpend);
            }
        }

        Ok(())
    }

    /// All outputs of this transaction as spendable UTXOs.
    pub fn created_utxos(&self) -> Vec<Utxo> {
        let txid = self.hash();
        self.outs
            .iter()
            .enumerate()
            .map(|(vout, out)| Utxo {
                txid,
                vout: vout as u32,
                value: out.value,
                pubkey_hash: out.pubkey_hash,
            })
            .collect()
    }
}

/// Assembles and signs a spending transaction from chosen UTXOs.
///
/// All inputs must be spendable by the single key handed to [`sign`];
/// that is also what consensus requires of a well-formed transaction.
///
/// [`sign`]: TransactionBuilder::sign
#[derive(Default)]
pub struct TransactionBuilder {
    inputs: Vec<Utxo>,
    outputs: Vec<TxOut>,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(mut self, utxo: Utxo) -> Self {
        self.inputs.push(utxo);
        self
    }

    pub fn add_output(mut self, value: u32, to: Hash160) -> Self {
        self.outputs.push(TxOut {
            value,
            pubkey_hash: to,
        });
        self
    }

    pub fn input_value(&self) -> u64 {
        self.inputs.iter().map(|u| u.value as u64).sum()
    }

    /// Signs every input with `key` and returns the final transaction.
    pub fn sign(self, key: &RsaPrivateKey) -> anyhow::Result<Transaction> {
        let pubkey = RsaPublicKey::from(key);
        let mut tx = Transaction {
            ins: self
                .inputs
                .iter()
                .map(|utxo| TxIn {
                    prev_txid: utxo.txid,
                    vout: utxo.vout,
                    unlock: Unlock::Script(ScriptSig {
                        pubkey: pubkey.clone(),
                        signature: Vec::new(),
                    }),
                })
                .collect(),
            outs: self.outputs,
        };

        for (k, utxo) in self.inputs.iter().enumerate() {
            let digest = tx.signing_digest(k, &utxo.pubkey_hash);
            let signature = key.sign(Pkcs1v15Sign::new::<Sha256>(), digest.as_bytes())?;
            if let Unlock::Script(script) = &mut tx.ins[k].unlock {
                script.signature = signature;
            }
        }

        Ok(tx)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Deterministic small test key.
    pub fn test_key(seed: u64) -> RsaPrivateKey {
        let mut rng = StdRng::seed_from_u64(seed);
        RsaPrivateKey::new(&mut rng, 512).expect("keygen")
    }

    pub fn utxo_for(key: &RsaPrivateKey, txid_tag: u8, vout: u32, value: u32) -> Utxo {
        Utxo {
            txid: sha256(&[txid_tag]),
            vout,
            value,
            pubkey_hash: pubkey_address(&RsaPublicKey::from(key)),
        }
    }
}
