//! Chain hashes.
//!
//! All ids on the chain (transaction hashes, block hashes, merkle nodes) are
//! double-SHA256 digests. Hashes are stored little-endian as on the wire and
//! displayed byte-reversed, the convention inherited from the bitcoin family.

use sha2::{Digest, Sha256};
use std::fmt;

/// Size of a chain hash in bytes.
pub const HASH_SIZE: usize = 32;

/// A 32-byte chain hash.
///
/// The ordering implementation compares the raw byte representation, which is
/// what the canonical transaction ordering rule sorts by.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash256(pub [u8; HASH_SIZE]);

impl Hash256 {
    /// The all-zero hash.
    pub const ZERO: Hash256 = Hash256([0u8; HASH_SIZE]);

    /// Wrap raw bytes as a hash.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Hash256(bytes)
    }

    /// Borrow the raw little-endian bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Whether this is the all-zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    /// Parse a hash from its display form (byte-reversed hex).
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        if raw.len() != HASH_SIZE {
            return None;
        }
        let mut bytes = [0u8; HASH_SIZE];
        for (i, b) in raw.iter().rev().enumerate() {
            bytes[i] = *b;
        }
        Some(Hash256(bytes))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "{}", hex::encode(reversed))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self)
    }
}

/// Double-SHA256 of `data`.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    Hash256(second.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_hash() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!sha256d(b"braid").is_zero());
    }

    #[test]
    fn test_display_roundtrip() {
        let h = sha256d(b"roundtrip");
        let parsed = Hash256::from_hex(&h.to_string()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(Hash256::from_hex("abcd").is_none());
        assert!(Hash256::from_hex("zz").is_none());
    }

    #[test]
    fn test_ordering_is_over_bytes() {
        let mut a = [0u8; HASH_SIZE];
        let mut b = [0u8; HASH_SIZE];
        a[0] = 1;
        b[0] = 2;
        assert!(Hash256(a) < Hash256(b));
    }
}
