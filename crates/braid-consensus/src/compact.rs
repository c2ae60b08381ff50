//! Compact (nBits) encoding of 256-bit targets and proof-of-work arithmetic.
//!
//! The compact form packs a 256-bit target into 32 bits, IEEE754-style:
//!
//! ```text
//! -------------------------------------------------
//! |   Exponent     |    Sign    |    Mantissa     |
//! -------------------------------------------------
//! | 8 bits [31-24] | 1 bit [23] | 23 bits [22-00] |
//! -------------------------------------------------
//! ```
//!
//! `N = (-1)^sign * mantissa * 256^(exponent-3)`. Targets are never negative
//! in valid blocks, but the sign bit is decoded anyway so invalid encodings
//! round-trip the same way everywhere.

use braid_primitives::{Hash256, HASH_SIZE};
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, Zero};

fn one_lsh_256() -> BigUint {
    BigUint::one() << 256
}

/// Decode a compact representation into a signed big integer.
pub fn compact_to_big(compact: u32) -> BigInt {
    let mantissa = compact & 0x007f_ffff;
    let negative = compact & 0x0080_0000 != 0;
    let exponent = compact >> 24;

    // The exponent is a byte count, so the mantissa shifts by whole bytes.
    let bn = if exponent <= 3 {
        BigInt::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigInt::from(mantissa) << (8 * (exponent - 3))
    };

    if negative {
        -bn
    } else {
        bn
    }
}

/// Encode a big integer into its compact representation. Only 23 bits of
/// mantissa precision survive; larger values keep their most significant
/// digits.
pub fn big_to_compact(n: &BigInt) -> u32 {
    if n.is_zero() {
        return 0;
    }

    let bytes = n.magnitude().to_bytes_be();
    let mut exponent = bytes.len() as u32;
    let mut mantissa: u32 = if exponent <= 3 {
        let mut value = 0u32;
        for &byte in &bytes {
            value = (value << 8) | byte as u32;
        }
        value << (8 * (3 - exponent))
    } else {
        ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32
    };

    // A mantissa with the sign bit set does not fit in 23 bits; drop one
    // byte into the exponent.
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        exponent += 1;
    }

    let mut compact = (exponent << 24) | mantissa;
    if n.sign() == Sign::Minus {
        compact |= 0x0080_0000;
    }
    compact
}

/// Interpret a hash as an unsigned big integer. Hashes are little-endian on
/// the wire, so the bytes are reversed first.
pub fn hash_to_big(hash: &Hash256) -> BigUint {
    let mut bytes = *hash.as_bytes();
    bytes.reverse();
    BigUint::from_bytes_be(&bytes)
}

/// The work a block at the given difficulty bits contributes to its chain:
/// `2^256 / (target + 1)`. A non-positive decoded target contributes zero;
/// that never happens in valid blocks but an invalid one could carry it.
pub fn calc_work(bits: u32) -> BigUint {
    let difficulty = compact_to_big(bits);
    if difficulty.sign() != Sign::Plus {
        return BigUint::zero();
    }
    let denominator = difficulty.magnitude() + BigUint::one();
    one_lsh_256() / denominator
}
