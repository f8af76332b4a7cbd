//! Canonical byte encodings
//!
//! Every type that is persisted or gossiped has exactly one byte layout,
//! defined here. Integers are little-endian. Decoders are total: any
//! length mismatch, bad delimiter, or trailing garbage yields
//! [`Malformed`], never a panic, regardless of input.

pub mod block;
pub mod tx;

use thiserror::Error;

/// Decoding failure. The message names the field that went wrong.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed encoding: {0}")]
pub struct Malformed(pub &'static str);

pub type Result<T> = std::result::Result<T, Malformed>;

/// Separator after every serialized transaction input.
pub const TXIN_DELIMITER: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

/// Separator after every transaction inside a block record.
pub const TX_DELIMITER: [u8; 4] = [0xef, 0xef, 0xef, 0xef];

/// Separator after every block (and undo) record in the segment files,
/// big-endian 0x1122334455667788.
pub const BLOCK_DELIMITER: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];

/// Bounded cursor over an input buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Malformed(what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u32_le(&mut self, what: &'static str) -> Result<u32> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    pub fn u64_le(&mut self, what: &'static str) -> Result<u64> {
        let bytes = self.take(8, what)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    pub fn i64_le(&mut self, what: &'static str) -> Result<i64> {
        let bytes = self.take(8, what)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    pub fn hash256(&mut self, what: &'static str) -> Result<crate::types::Hash256> {
        Ok(crate::types::Hash256::from_slice(self.take(32, what)?))
    }

    pub fn hash160(&mut self, what: &'static str) -> Result<crate::types::Hash160> {
        Ok(crate::types::Hash160::from_slice(self.take(20, what)?))
    }

    /// Consumes `expected` or fails.
    pub fn expect(&mut self, expected: &[u8], what: &'static str) -> Result<()> {
        let actual = self.take(expected.len(), what)?;
        if actual != expected {
            return Err(Malformed(what));
        }
        Ok(())
    }

    /// Fails unless the whole input was consumed.
    pub fn finish(&self, what: &'static str) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Malformed(what));
        }
        Ok(())
    }

    /// A length prefix that must still fit in the remaining input.
    pub fn length(&mut self, what: &'static str) -> Result<usize> {
        let len = self.u64_le(what)?;
        if len > self.remaining() as u64 {
            return Err(Malformed(what));
        }
        Ok(len as usize)
    }
}
