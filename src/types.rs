//! Hash primitives and digest helpers
//!
//! Two fixed-width digests run through the whole system: 256-bit SHA-256
//! values identify blocks and transactions, 160-bit RIPEMD160(SHA256(..))
//! values identify public keys (addresses). Addresses render as base58,
//! everything else as hex.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

/// A 20-byte RIPEMD160(SHA256(..)) digest, used as an address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash160(pub [u8; 20]);

#[derive(Debug, Error, PartialEq)]
pub enum ParseHashError {
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("invalid base58: {0}")]
    Base58(String),
    #[error("wrong digest length: expected {expected}, got {got}")]
    Length { expected: usize, got: usize },
}

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Builds a hash from a slice, zero-padding or truncating to 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Hash256 {
        let mut out = [0u8; 32];
        let n = bytes.len().min(32);
        out[..n].copy_from_slice(&bytes[..n]);
        Hash256(out)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self)
    }
}

impl FromStr for Hash256 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s).map_err(|e| ParseHashError::Hex(e.to_string()))?;
        if decoded.len() != 32 {
            return Err(ParseHashError::Length {
                expected: 32,
                got: decoded.len(),
            });
        }
        Ok(Hash256::from_slice(&decoded))
    }
}

impl Hash160 {
    pub const ZERO: Hash160 = Hash160([0u8; 20]);

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Hash160 {
        let mut out = [0u8; 20];
        let n = bytes.len().min(20);
        out[..n].copy_from_slice(&bytes[..n]);
        Hash160(out)
    }
}

impl fmt::Display for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash160({})", self)
    }
}

impl FromStr for Hash160 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|e| ParseHashError::Base58(e.to_string()))?;
        if decoded.len() != 20 {
            return Err(ParseHashError::Length {
                expected: 20,
                got: decoded.len(),
            });
        }
        Ok(Hash160::from_slice(&decoded))
    }
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    Hash256::from_slice(&digest)
}

/// SHA-256 applied twice.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    Hash256::from_slice(&second)
}

/// RIPEMD-160 over SHA-256 of `data`.
pub fn hash160(data: &[u8]) -> Hash160 {
    use ripemd::Ripemd160;
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    Hash160::from_slice(&ripe)
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
