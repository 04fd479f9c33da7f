//! 128-bit hashes used to identify positions and table entries.
//!
//! Nodes in the shared table, subtree-bias entries, and evaluator outputs are
//! all keyed by a 128-bit hash. A collision would silently merge two distinct
//! positions, so we keep the full 128 bits everywhere rather than truncating.

use std::fmt;

/// A 128-bit hash, stored as two 64-bit halves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash128 {
    pub hash0: u64,
    pub hash1: u64,
}

impl Hash128 {
    pub const ZERO: Hash128 = Hash128 { hash0: 0, hash1: 0 };

    pub const fn new(hash0: u64, hash1: u64) -> Hash128 {
        Hash128 { hash0, hash1 }
    }

    /// Mix another hash in, preserving all 128 bits.
    #[inline]
    pub fn combine(self, other: Hash128) -> Hash128 {
        Hash128 {
            hash0: mix64(self.hash0 ^ other.hash0.rotate_left(17)),
            hash1: mix64(self.hash1 ^ other.hash1.rotate_left(43)),
        }
    }

    /// Mix a plain integer in.
    #[inline]
    pub fn mix_u64(self, x: u64) -> Hash128 {
        Hash128 {
            hash0: mix64(self.hash0 ^ x),
            hash1: mix64(self.hash1.wrapping_add(mix64(x ^ 0x9e3779b97f4a7c15))),
        }
    }

    pub fn is_zero(self) -> bool {
        self.hash0 == 0 && self.hash1 == 0
    }
}

impl std::ops::BitXor for Hash128 {
    type Output = Hash128;
    fn bitxor(self, rhs: Hash128) -> Hash128 {
        Hash128 {
            hash0: self.hash0 ^ rhs.hash0,
            hash1: self.hash1 ^ rhs.hash1,
        }
    }
}

impl std::ops::BitXorAssign for Hash128 {
    fn bitxor_assign(&mut self, rhs: Hash128) {
        self.hash0 ^= rhs.hash0;
        self.hash1 ^= rhs.hash1;
    }
}

impl fmt::Debug for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}{:016X}", self.hash0, self.hash1)
    }
}

impl fmt::Display for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}{:016X}", self.hash0, self.hash1)
    }
}

/// splitmix64 finalizer. Good avalanche behavior for cheap incremental mixing.
#[inline]
pub fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// Hash an arbitrary byte string down to 128 bits. Used for seed strings.
pub fn hash_of_bytes(bytes: &[u8]) -> Hash128 {
    let mut h = Hash128::new(0x6a09e667f3bcc908, 0xbb67ae8584caa73b);
    for chunk in bytes.chunks(8) {
        let mut x = [0u8; 8];
        x[..chunk.len()].copy_from_slice(chunk);
        h = h.mix_u64(u64::from_le_bytes(x));
    }
    h.mix_u64(bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_is_not_commutative_noise() {
        let a = Hash128::new(1, 2);
        let b = Hash128::new(3, 4);
        assert_ne!(a.combine(b), b.combine(a));
        assert_ne!(a.combine(b), Hash128::ZERO);
    }

    #[test]
    fn mix_u64_changes_both_halves() {
        let h = Hash128::new(5, 6).mix_u64(123);
        assert_ne!(h.hash0, 5);
        assert_ne!(h.hash1, 6);
    }

    #[test]
    fn bytes_hashing_is_stable_and_length_sensitive() {
        let a = hash_of_bytes(b"seed$0");
        let b = hash_of_bytes(b"seed$0");
        let c = hash_of_bytes(b"seed$1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(hash_of_bytes(b"ab"), hash_of_bytes(b"ab\0"));
    }
}
