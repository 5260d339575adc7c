//! Compact difficulty bits, per-block work and the header PoW check.

use primitive_types::U256;

use crate::error::HeaderError;
use crate::types::Hash256;

/// Expand compact `bits` into a 256-bit target. Negative or overflowing
/// encodings are rejected.
pub fn compact_to_u256(bits: u32) -> Result<U256, HeaderError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 {
        return Err(HeaderError::BadBits(bits));
    }
    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
            return Err(HeaderError::BadBits(bits));
        }
        U256::from(word) << (8 * (size - 3))
    };
    Ok(value)
}

/// Expected number of hashes to find a block at `bits`:
/// `2^256 / (target + 1)`, computed as `(!target / (target + 1)) + 1`.
pub fn block_proof(bits: u32) -> U256 {
    match compact_to_u256(bits) {
        Ok(target) if !target.is_zero() => (!target / (target + U256::one())) + U256::one(),
        _ => U256::zero(),
    }
}

/// Check that `hash` meets the target encoded in `bits` and that the target
/// does not exceed `pow_limit_bits`.
pub fn check_proof_of_work(hash: &Hash256, bits: u32, pow_limit_bits: u32) -> Result<(), HeaderError> {
    let target = compact_to_u256(bits)?;
    let limit = compact_to_u256(pow_limit_bits)?;
    if target.is_zero() || target > limit {
        return Err(HeaderError::BadBits(bits));
    }
    if U256::from_little_endian(hash.as_bytes()) > target {
        return Err(HeaderError::HighHash(*hash));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_limit_expands() {
        let target = compact_to_u256(0x1d00ffff).unwrap();
        assert_eq!(target, U256::from(0xffffu64) << 208);
    }

    #[test]
    fn negative_bits_rejected() {
        assert!(compact_to_u256(0x1d80ffff).is_err());
    }

    #[test]
    fn proof_of_easiest_target_is_two() {
        // 0x207fffff is just under 2^255, so about two hashes per block.
        assert_eq!(block_proof(0x207fffff), U256::from(2u64));
    }

    #[test]
    fn harder_bits_mean_more_work() {
        assert!(block_proof(0x1d00ffff) > block_proof(0x207fffff));
        assert_eq!(block_proof(0x1d00ffff), U256::from(0x1_0001_0001u64));
    }

    #[test]
    fn pow_check_respects_limit_and_target() {
        assert!(check_proof_of_work(&Hash256::ZERO, 0x207fffff, 0x207fffff).is_ok());
        assert_eq!(
            check_proof_of_work(&Hash256::ZERO, 0x207fffff, 0x1d00ffff),
            Err(HeaderError::BadBits(0x207fffff))
        );
        let high = Hash256([0xff; 32]);
        assert_eq!(check_proof_of_work(&high, 0x207fffff, 0x207fffff), Err(HeaderError::HighHash(high)));
    }
}
