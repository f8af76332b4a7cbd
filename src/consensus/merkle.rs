//! Merkle tree over transaction hashes
//!
//! Binary SHA-256 tree with the odd last leaf duplicated at every level.
//! The root of a single-leaf tree is the leaf itself.

use crate::types::{sha256, Hash256};

/// Computes the Merkle root of an ordered list of transaction hashes.
///
/// An empty list yields the zero hash; block validation rules out empty
/// blocks before this is ever relevant.
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return Hash256::ZERO;
    }

    let mut level: Vec<Hash256> = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().expect("level is non-empty"));
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut joined = [0u8; 64];
                joined[..32].copy_from_slice(pair[0].as_bytes());
                joined[32..].copy_from_slice(pair[1].as_bytes());
                sha256(&joined)
            })
            .collect();
    }
    level[0]
}
