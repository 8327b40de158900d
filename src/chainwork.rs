/// Proof-of-work arithmetic
///
/// The best chain is the one with the most accumulated work.
/// Work for a block = 2^256 / (target + 1), where the target is expanded
/// from the compact nBits representation.
///
/// Work values are 256-bit integers stored big-endian in 32 bytes, so the
/// derived lexicographic ordering is the numeric ordering.

use num_bigint::BigUint;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

/// Cumulative proof-of-work, big-endian 256-bit
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct Work(pub [u8; 32]);

impl Work {
    pub fn zero() -> Work {
        Work([0u8; 32])
    }

    /// Work proven by a single header with the given compact target
    pub fn from_bits(n_bits: u32) -> Work {
        Work(calculate_work_from_bits(n_bits))
    }

    pub fn add(&self, other: &Work) -> Work {
        let a = BigUint::from_bytes_be(&self.0);
        let b = BigUint::from_bytes_be(&other.0);
        let sum = a + b;

        let sum_bytes = sum.to_bytes_be();
        let mut result = [0u8; 32];
        let take = sum_bytes.len().min(32);
        result[32 - take..].copy_from_slice(&sum_bytes[sum_bytes.len() - take..]);
        Work(result)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Calculate the work (difficulty) represented by a compact target (nBits)
///
/// Returns work as a 256-bit value stored in a 32-byte array (big-endian).
pub fn calculate_work_from_bits(n_bits: u32) -> [u8; 32] {
    let target = match expand_target(n_bits) {
        Some(t) => t,
        None => return [0u8; 32],
    };

    if target.is_zero() {
        return [0u8; 32];
    }

    // Work = 2^256 / (target + 1), full 256-bit precision
    let numerator = BigUint::one() << 256;
    let denominator = target + BigUint::one();
    let work: BigUint = numerator / denominator;

    let work_bytes = work.to_bytes_be();
    let mut result = [0u8; 32];
    let start = 32 - work_bytes.len().min(32);
    result[start..].copy_from_slice(&work_bytes[..work_bytes.len().min(32)]);
    result
}

/// Expand the compact nBits form into the full 256-bit target
///
/// target = mantissa * 256^(exponent - 3). Returns None for a zero or
/// nonsensical encoding.
pub fn expand_target(n_bits: u32) -> Option<BigUint> {
    let exponent = n_bits >> 24;
    let mantissa = n_bits & 0x00ffffff;

    if mantissa == 0 || exponent == 0 {
        return None;
    }

    let target = if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        let shift_bytes = exponent - 3;
        BigUint::from(mantissa) << (8 * shift_bytes)
    };

    if target.is_zero() {
        None
    } else {
        Some(target)
    }
}

/// Check that a block hash satisfies the target implied by nBits
///
/// The hash is interpreted as a little-endian 256-bit integer, the same
/// interpretation miners grind against.
pub fn check_proof_of_work(hash: &[u8; 32], n_bits: u32) -> bool {
    let target = match expand_target(n_bits) {
        Some(t) => t,
        None => return false,
    };

    BigUint::from_bytes_le(hash) <= target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_calculation() {
        // Difficulty 1 target: nBits = 0x1d00ffff
        let bits = 0x1d00ffff;
        let work = calculate_work_from_bits(bits);
        assert_ne!(work, [0u8; 32]);

        // Higher difficulty (lower target) should have more work
        let higher_difficulty_bits = 0x1b0404cb;
        let higher_work = calculate_work_from_bits(higher_difficulty_bits);
        assert!(
            Work(higher_work) > Work(work),
            "Higher difficulty should yield more work"
        );
    }

    #[test]
    fn test_zero_bits() {
        assert_eq!(calculate_work_from_bits(0), [0u8; 32]);
    }

    #[test]
    fn test_work_add() {
        let a = Work::from_bits(0x1d00ffff);
        let b = Work::from_bits(0x1d00ffff);
        let sum = a.add(&b);
        assert!(sum > a);

        // 2 * difficulty-1 work equals the sum
        let doubled = a.add(&Work::zero()).add(&a);
        assert_eq!(sum, doubled);
    }

    #[test]
    fn test_work_ordering_is_numeric() {
        let small = Work::from_bits(0x207fffff);
        let large = Work::from_bits(0x1d00ffff);
        assert!(large > small);
        assert!(Work::zero() < small);
    }

    #[test]
    fn test_proof_of_work_permissive_target() {
        // Regtest-style target accepts essentially any hash
        assert!(check_proof_of_work(&[0x55u8; 32], 0x207fffff));

        // but not one above 0x7fffff00...
        assert!(!check_proof_of_work(&[0xffu8; 32], 0x207fffff));
    }

    #[test]
    fn test_proof_of_work_difficulty_one() {
        // A hash with its top 4 bytes zero meets the difficulty-1 target
        let mut hash = [0xffu8; 32];
        hash[28] = 0;
        hash[29] = 0;
        hash[30] = 0;
        hash[31] = 0;
        assert!(check_proof_of_work(&hash, 0x1d00ffff));

        // All-ff hash does not
        assert!(!check_proof_of_work(&[0xffu8; 32], 0x1d00ffff));
    }
}
