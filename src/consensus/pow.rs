//! Proof of work: compact targets and difficulty retargeting
//!
//! A difficulty target is a 256-bit threshold packed into 32 bits as one
//! exponent byte `e` and a three-byte mantissa `m`; the expanded value is
//! `m << 8*(e-3)` (right-shifted instead when `e < 3`). A header satisfies
//! the target when its hash, read as a big-endian integer, is strictly
//! below the expanded value.

use crate::consensus::error::{ConsensusError, Result};
use crate::types::Hash256;
use std::cmp::Ordering;

/// 256-bit unsigned integer, little-endian 64-bit limbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U256([u64; 4]);

impl U256 {
    pub const ZERO: U256 = U256([0; 4]);

    pub fn from_u32(value: u32) -> Self {
        U256([value as u64, 0, 0, 0])
    }

    /// Interprets 32 bytes as a big-endian integer, matching how block
    /// hashes compare against targets.
    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut limbs = [0u64; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let start = (3 - i) * 8;
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[start..start + 8]);
            *limb = u64::from_be_bytes(chunk);
        }
        U256(limbs)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&limb| limb == 0)
    }

    fn low_u64(&self) -> u64 {
        self.0[0]
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }
        let mut out = U256::ZERO;
        let limb_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in 0..4 {
            if i + limb_shift < 4 {
                out.0[i + limb_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + limb_shift + 1 < 4 {
                    out.0[i + limb_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }
        out
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }
        let mut out = U256::ZERO;
        let limb_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in limb_shift..4 {
            out.0[i - limb_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i + 1 < 4 {
                out.0[i - limb_shift] |= self.0[i + 1] << (64 - bit_shift);
            }
        }
        out
    }

    /// Multiply by a 64-bit scalar; `None` on overflow past 256 bits.
    pub fn checked_mul_u64(&self, rhs: u64) -> Option<Self> {
        let mut carry = 0u128;
        let mut out = U256::ZERO;
        for i in 0..4 {
            let product = (self.0[i] as u128) * (rhs as u128) + carry;
            out.0[i] = product as u64;
            carry = product >> 64;
        }
        if carry > 0 {
            None
        } else {
            Some(out)
        }
    }

    /// Integer division by a 64-bit scalar. Division by zero saturates,
    /// callers guard against it.
    pub fn div_u64(&self, rhs: u64) -> Self {
        if rhs == 0 {
            return U256([u64::MAX; 4]);
        }
        let mut remainder = 0u128;
        let mut out = U256::ZERO;
        for i in (0..4).rev() {
            let dividend = (remainder << 64) | (self.0[i] as u128);
            out.0[i] = (dividend / rhs as u128) as u64;
            remainder = dividend % rhs as u128;
        }
        out
    }

    /// Position of the highest set bit, or `None` when zero.
    fn highest_set_bit(&self) -> Option<u32> {
        for (i, &limb) in self.0.iter().enumerate().rev() {
            if limb != 0 {
                return Some(i as u32 * 64 + (63 - limb.leading_zeros()));
            }
        }
        None
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

/// Expands compact `nbits` into the full 256-bit target.
pub fn expand_target(nbits: u32) -> Result<U256> {
    let exponent = nbits >> 24;
    let mantissa = nbits & 0x00ff_ffff;

    // Mantissa is three bytes; anything above exponent 32 cannot be
    // represented in 256 bits.
    if exponent > 32 {
        return Err(ConsensusError::BadTarget);
    }
    if mantissa == 0 {
        return Ok(U256::ZERO);
    }

    let mantissa = U256::from_u32(mantissa);
    if exponent >= 3 {
        Ok(mantissa.shl(8 * (exponent - 3)))
    } else {
        Ok(mantissa.shr(8 * (3 - exponent)))
    }
}

/// Compresses a 256-bit target back into compact form.
///
/// The mantissa keeps its top bit (0x00800000) clear by shifting one more
/// byte into the exponent when needed, so the round trip through
/// [`expand_target`] is stable up to normalization.
pub fn compress_target(target: &U256) -> Result<u32> {
    let highest_bit = match target.highest_set_bit() {
        Some(bit) => bit,
        None => return Ok(0),
    };

    let size = (highest_bit / 8) + 1;
    let mut compact: u64 = if size <= 3 {
        target.low_u64() << (8 * (3 - size))
    } else {
        target.shr(8 * (size - 3)).low_u64()
    };

    let mut size = size;
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    if size > 0xff {
        return Err(ConsensusError::BadTarget);
    }

    Ok((size << 24) | (compact as u32 & 0x007f_ffff))
}

/// True when `hash`, as a big-endian integer, is strictly below the target
/// encoded by `nbits`.
pub fn hash_meets_target(hash: &Hash256, nbits: u32) -> Result<bool> {
    let target = expand_target(nbits)?;
    Ok(U256::from_be_bytes(hash.as_bytes()) < target)
}

/// Recomputes the target after a retarget interval.
///
/// `anchor_nbits` is the difficulty of the first block of the elapsed
/// interval, `elapsed_secs` the timestamp difference across it. The new
/// target scales the anchor by observed over expected time, clamped to the
/// minimum difficulty `floor_nbits`. All clamps are deterministic: elapsed
/// time is floored at one second, and multiplication overflow falls back to
/// the floor target.
pub fn retarget(
    anchor_nbits: u32,
    elapsed_secs: i64,
    interval: u32,
    expected_block_secs: u32,
    floor_nbits: u32,
) -> Result<u32> {
    let anchor = expand_target(anchor_nbits)?;
    let floor = expand_target(floor_nbits)?;
    let elapsed = elapsed_secs.max(1) as u64;
    let expected = interval as u64 * expected_block_secs as u64;

    let scaled = match anchor.checked_mul_u64(elapsed) {
        Some(widened) => widened.div_u64(expected),
        None => floor,
    };
    let clamped = if scaled > floor { floor } else { scaled };

    compress_target(&clamped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_expand_initial_bits() {
        // 0x1e7fffff: mantissa 0x7fffff shifted left 27 bytes.
        let target = expand_target(0x1e7f_ffff).unwrap();
        assert!(!target.is_zero());
        let again = compress_target(&target).unwrap();
        assert_eq!(again, 0x1e7f_ffff);
    }

    #[test]
    fn test_expand_zero_mantissa() {
        assert!(expand_target(0x1d00_0000).unwrap().is_zero());
    }

    #[test]
    fn test_expand_small_exponent_truncates_right() {
        // exponent 2: mantissa shifted right one byte.
        let target = expand_target(0x0200_ffff).unwrap();
        assert_eq!(target, U256::from_u32(0x00ff));
    }

    #[test]
    fn test_compress_normalizes_sign_bit() {
        // A target whose top mantissa byte would be >= 0x80 must move a
        // byte into the exponent.
        let target = U256::from_u32(0x0080_0000);
        let compact = compress_target(&target).unwrap();
        assert_eq!(compact, 0x0400_8000);
        assert_eq!(expand_target(compact).unwrap(), target);
    }

    #[test]
    fn test_hash_meets_target_boundaries() {
        let zero_hash = Hash256::ZERO;
        assert!(hash_meets_target(&zero_hash, 0x1e7f_ffff).unwrap());

        let max_hash = Hash256([0xff; 32]);
        assert!(!hash_meets_target(&max_hash, 0x1e7f_ffff).unwrap());
    }

    #[test]
    fn test_retarget_unchanged_for_expected_time() {
        let interval = 20;
        let expected = 15;
        let out = retarget(
            0x1e7f_ffff,
            (interval * expected) as i64,
            interval,
            expected,
            0x1e7f_ffff,
        )
        .unwrap();
        assert_eq!(out, 0x1e7f_ffff);
    }

    #[test]
    fn test_retarget_fast_interval_hardens() {
        // Blocks produced 300x faster than expected: target must shrink.
        let out = retarget(0x1e7f_ffff, 1, 20, 15, 0x1e7f_ffff).unwrap();
        let new_target = expand_target(out).unwrap();
        let old_target = expand_target(0x1e7f_ffff).unwrap();
        assert!(new_target < old_target);
    }

    #[test]
    fn test_retarget_slow_interval_clamped_to_floor() {
        // Ten times slower than expected would ease past the minimum
        // difficulty; the result clamps to the floor.
        let out = retarget(0x1e7f_ffff, 3000, 20, 15, 0x1e7f_ffff).unwrap();
        assert_eq!(out, 0x1e7f_ffff);
    }

    #[test]
    fn test_retarget_non_positive_elapsed() {
        let out = retarget(0x1e7f_ffff, -5, 20, 15, 0x1e7f_ffff).unwrap();
        let fast = retarget(0x1e7f_ffff, 1, 20, 15, 0x1e7f_ffff).unwrap();
        assert_eq!(out, fast);
    }

    #[test]
    fn test_u256_ordering() {
        let small = U256::from_u32(7);
        let big = U256::from_u32(8).shl(128);
        assert!(small < big);
        assert!(big > small);
    }

    #[test]
    fn test_u256_mul_div_round_trip() {
        let value = U256::from_u32(0x00ff_ffff).shl(64);
        let multiplied = value.checked_mul_u64(3600).unwrap();
        assert_eq!(multiplied.div_u64(3600), value);
    }

    #[test]
    fn test_u256_mul_overflow() {
        let top = U256::from_u32(1).shl(255);
        assert!(top.checked_mul_u64(2).is_none());
    }

    proptest! {
        /// Round-trip law: for any normalized compact value in the working
        /// range, expand then compress reproduces the input.
        #[test]
        fn prop_compact_round_trip(exponent in 4u32..=30u32, mantissa in 0x0000_8000u32..=0x007f_ffffu32) {
            let nbits = (exponent << 24) | mantissa;
            let expanded = expand_target(nbits).unwrap();
            let compact = compress_target(&expanded).unwrap();
            prop_assert_eq!(compact, nbits);
        }

        #[test]
        fn prop_expanded_targets_order_by_exponent(mantissa in 1u32..=0x007f_ffffu32) {
            let lo = expand_target((10 << 24) | mantissa).unwrap();
            let hi = expand_target((11 << 24) | mantissa).unwrap();
            prop_assert!(lo < hi);
        }
    }
}
