//! Transaction, script, and UTXO encodings
//!
//! Layout per transaction:
//!
//! ```text
//! n_in  : u64 LE
//! per input:  prev_txid(32) || vout u32 LE || siglen u64 LE || sig_data || 0xffffffff
//! n_out : u64 LE
//! per output: pubkey_hash(20) || value u32 LE
//! ```
//!
//! `sig_data` carries the raw coinbase bytes when `prev_txid` is zero,
//! otherwise a script-sig: `|N| u64 LE || N (big-endian) || E u64 LE ||
//! signature tail`.

use super::{Malformed, Reader, Result, TXIN_DELIMITER};
use crate::consensus::transaction::{ScriptSig, Transaction, TxIn, TxOut, Unlock};
use crate::consensus::utxo::Utxo;
use crate::types::Hash160;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};

/// Fixed size of an encoded UTXO.
pub const UTXO_SIZE: usize = 60;

pub fn encode_script_sig(script: &ScriptSig) -> Vec<u8> {
    let modulus = script.pubkey.n().to_bytes_be();
    let mut exponent = [0u8; 8];
    let e = script.pubkey.e().to_bytes_le();
    let n = e.len().min(8);
    exponent[..n].copy_from_slice(&e[..n]);

    let mut out = Vec::with_capacity(8 + modulus.len() + 8 + script.signature.len());
    out.extend_from_slice(&(modulus.len() as u64).to_le_bytes());
    out.extend_from_slice(&modulus);
    out.extend_from_slice(&exponent);
    out.extend_from_slice(&script.signature);
    out
}

pub fn decode_script_sig(buf: &[u8]) -> Result<ScriptSig> {
    let mut r = Reader::new(buf);
    let modulus_len = r.length("script-sig modulus length")?;
    let modulus = BigUint::from_bytes_be(r.take(modulus_len, "script-sig modulus")?);
    let exponent = BigUint::from_bytes_le(r.take(8, "script-sig exponent")?);
    let signature = r.take(r.remaining(), "script-sig signature")?.to_vec();

    let pubkey =
        RsaPublicKey::new(modulus, exponent).map_err(|_| Malformed("script-sig public key"))?;
    Ok(ScriptSig { pubkey, signature })
}

pub fn encode_script_pubkey(pubkey_hash: &Hash160) -> Vec<u8> {
    pubkey_hash.as_bytes().to_vec()
}

pub fn decode_script_pubkey(buf: &[u8]) -> Result<Hash160> {
    let mut r = Reader::new(buf);
    let hash = r.hash160("script-pubkey hash")?;
    r.finish("script-pubkey trailing bytes")?;
    Ok(hash)
}

fn encode_txin(input: &TxIn, out: &mut Vec<u8>) {
    let sig_data = match &input.unlock {
        Unlock::Coinbase(data) => data.clone(),
        Unlock::Script(script) => encode_script_sig(script),
    };
    out.extend_from_slice(input.prev_txid.as_bytes());
    out.extend_from_slice(&input.vout.to_le_bytes());
    out.extend_from_slice(&(sig_data.len() as u64).to_le_bytes());
    out.extend_from_slice(&sig_data);
    out.extend_from_slice(&TXIN_DELIMITER);
}

fn read_txin(r: &mut Reader<'_>) -> Result<TxIn> {
    let prev_txid = r.hash256("input prev txid")?;
    let vout = r.u32_le("input vout")?;
    let sig_len = r.length("input script length")?;
    let sig_data = r.take(sig_len, "input script data")?;
    r.expect(&TXIN_DELIMITER, "input delimiter")?;

    // Coinbase inputs store raw bytes in place of the script-sig; the
    // zero txid is what tells them apart.
    let unlock = if prev_txid.is_zero() {
        Unlock::Coinbase(sig_data.to_vec())
    } else {
        Unlock::Script(decode_script_sig(sig_data)?)
    };
    Ok(TxIn {
        prev_txid,
        vout,
        unlock,
    })
}

fn encode_txout(output: &TxOut, out: &mut Vec<u8>) {
    out.extend_from_slice(output.pubkey_hash.as_bytes());
    out.extend_from_slice(&output.value.to_le_bytes());
}

fn read_txout(r: &mut Reader<'_>) -> Result<TxOut> {
    let pubkey_hash = r.hash160("output pubkey hash")?;
    let value = r.u32_le("output value")?;
    Ok(TxOut { value, pubkey_hash })
}

pub fn encode(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(tx.ins.len() as u64).to_le_bytes());
    for input in &tx.ins {
        encode_txin(input, &mut out);
    }
    out.extend_from_slice(&(tx.outs.len() as u64).to_le_bytes());
    for output in &tx.outs {
        encode_txout(output, &mut out);
    }
    out
}

/// Reads one transaction from the cursor, leaving it positioned after the
/// last output.
pub fn read_transaction(r: &mut Reader<'_>) -> Result<Transaction> {
    let n_in = r.u64_le("input count")?;
    if n_in > r.remaining() as u64 {
        return Err(Malformed("input count"));
    }
    let mut ins = Vec::with_capacity(n_in as usize);
    for _ in 0..n_in {
        ins.push(read_txin(r)?);
    }

    let n_out = r.u64_le("output count")?;
    if n_out > r.remaining() as u64 {
        return Err(Malformed("output count"));
    }
    let mut outs = Vec::with_capacity(n_out as usize);
    for _ in 0..n_out {
        outs.push(read_txout(r)?);
    }

    Ok(Transaction { ins, outs })
}

pub fn decode(buf: &[u8]) -> Result<Transaction> {
    let mut r = Reader::new(buf);
    let tx = read_transaction(&mut r)?;
    r.finish("transaction trailing bytes")?;
    Ok(tx)
}

pub fn encode_utxo(utxo: &Utxo) -> Vec<u8> {
    let mut out = Vec::with_capacity(UTXO_SIZE);
    out.extend_from_slice(utxo.txid.as_bytes());
    out.extend_from_slice(&utxo.vout.to_le_bytes());
    out.extend_from_slice(utxo.pubkey_hash.as_bytes());
    out.extend_from_slice(&utxo.value.to_le_bytes());
    out
}

pub fn decode_utxo(buf: &[u8]) -> Result<Utxo> {
    let mut r = Reader::new(buf);
    let txid = r.hash256("utxo txid")?;
    let vout = r.u32_le("utxo vout")?;
    let pubkey_hash = r.hash160("utxo pubkey hash")?;
    let value = r.u32_le("utxo value")?;
    r.finish("utxo trailing bytes")?;
    Ok(Utxo {
        txid,
        vout,
        value,
        pubkey_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::transaction::test_support::test_key;
    use crate::consensus::transaction::TransactionBuilder;
    use crate::types::{sha256, Hash160};

    #[test]
    fn test_coinbase_round_trip() {
        let tx = Transaction::coinbase(b"cafe".to_vec(), Hash160::from_slice(&[3; 20]), 1000, 25);
        let decoded = decode(&encode(&tx)).unwrap();
        assert_eq!(tx, decoded);
        assert!(decoded.is_coinbase());
    }

    #[test]
    fn test_signed_transaction_round_trip() {
        let key = test_key(40);
        let utxo = Utxo {
            txid: sha256(b"prev"),
            vout: 1,
            value: 700,
            pubkey_hash: crate::consensus::transaction::pubkey_address(
                &rsa::RsaPublicKey::from(&key),
            ),
        };
        let tx = TransactionBuilder::new()
            .add_input(utxo)
            .add_output(600, Hash160::from_slice(&[9; 20]))
            .add_output(50, Hash160::from_slice(&[8; 20]))
            .sign(&key)
            .unwrap();

        let decoded = decode(&encode(&tx)).unwrap();
        assert_eq!(tx, decoded);
        assert_eq!(tx.hash(), decoded.hash());
    }

    #[test]
    fn test_utxo_round_trip_and_size() {
        let utxo = Utxo {
            txid: sha256(b"id"),
            vout: 7,
            value: 1234,
            pubkey_hash: Hash160::from_slice(&[5; 20]),
        };
        let bytes = encode_utxo(&utxo);
        assert_eq!(bytes.len(), UTXO_SIZE);
        assert_eq!(decode_utxo(&bytes).unwrap(), utxo);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let tx = Transaction::coinbase(b"x".to_vec(), Hash160::ZERO, 1, 0);
        let mut bytes = encode(&tx);
        bytes.push(0);
        assert_eq!(
            decode(&bytes),
            Err(Malformed("transaction trailing bytes"))
        );
    }

    #[test]
    fn test_truncated_input_rejected() {
        let tx = Transaction::coinbase(b"x".to_vec(), Hash160::ZERO, 1, 0);
        let bytes = encode(&tx);
        assert!(decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_hostile_counts_rejected() {
        // Input count far beyond the buffer must fail without allocating.
        let mut bytes = u64::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 16]);
        assert_eq!(decode(&bytes), Err(Malformed("input count")));
    }

    #[test]
    fn test_bad_delimiter_rejected() {
        let tx = Transaction::coinbase(b"x".to_vec(), Hash160::ZERO, 1, 0);
        let mut bytes = encode(&tx);
        // The input delimiter sits right before the output count section;
        // corrupt one of its 0xff bytes.
        let delim_pos = 8 + 32 + 4 + 8 + 1;
        bytes[delim_pos] = 0x00;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_script_sig_round_trip() {
        let key = test_key(41);
        let script = ScriptSig {
            pubkey: rsa::RsaPublicKey::from(&key),
            signature: vec![1, 2, 3, 4],
        };
        let decoded = decode_script_sig(&encode_script_sig(&script)).unwrap();
        assert_eq!(script, decoded);
    }

    #[test]
    fn test_script_pubkey_round_trip() {
        let hash = Hash160::from_slice(&[0xab; 20]);
        assert_eq!(
            decode_script_pubkey(&encode_script_pubkey(&hash)).unwrap(),
            hash
        );
    }
}
