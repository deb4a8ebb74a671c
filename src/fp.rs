//! Fingerprint tag (component A).
//!
//! An opaque 128-bit value with total order, `combine` (order-sensitive
//! concatenation of a sequence of fingerprints), `xor_low` (xor of the
//! low words of a sequence), and `extend` (mix in raw bytes). The real
//! evaluator-side fingerprint algorithm lives outside this crate
//! (spec.md §1, "deliberately out of scope"); this is the abstract tag
//! the core operates on, grounded on how `rusty-db`'s checksum helpers
//! (`transaction/wal.rs`) mix hardware CRC32C with a software fallback.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque 128-bit fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    hi: u64,
    lo: u64,
}

impl Fingerprint {
    pub const ZERO: Fingerprint = Fingerprint { hi: 0, lo: 0 };

    pub const fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    pub const fn low(&self) -> u64 {
        self.lo
    }

    pub const fn high(&self) -> u64 {
        self.hi
    }

    /// Fingerprint of a byte string, for tests and diagnostic tooling.
    /// The real evaluator hashes its own terms; this crate only needs a
    /// stable, deterministic tag to exercise the contract with.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hi: u64 = 0xcbf29ce484222325;
        let mut lo: u64 = 0x100000001b3;
        for &b in bytes {
            hi = (hi ^ b as u64).wrapping_mul(0x100000001b3);
            lo = lo.rotate_left(7) ^ (b as u64).wrapping_mul(0x9E3779B97F4A7C15);
        }
        Fingerprint { hi, lo }
    }

    /// `extend(bytes)`: mix additional bytes into this fingerprint,
    /// producing a new one. Used when the core needs to derive a tag
    /// from existing state plus new context (e.g. `instance_fp`
    /// extended with the current entry count).
    pub fn extend(&self, bytes: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(16 + bytes.len());
        buf.extend_from_slice(&self.hi.to_le_bytes());
        buf.extend_from_slice(&self.lo.to_le_bytes());
        buf.extend_from_slice(bytes);
        Self::of_bytes(&buf)
    }

    /// `combine(sequence)`: order-sensitive concatenation of a sequence
    /// of fingerprints into one. Used for `common_fp` and the ordered
    /// `uncommon_tag.fp`.
    pub fn combine<'a, I: IntoIterator<Item = &'a Fingerprint>>(fps: I) -> Self {
        let mut hi: u64 = 0x9E3779B97F4A7C15;
        let mut lo: u64 = 0xC2B2AE3D27D4EB4F;
        for fp in fps {
            hi = hi.rotate_left(13) ^ fp.hi;
            hi = hi.wrapping_mul(0xff51afd7ed558ccd);
            lo = lo.rotate_left(17) ^ fp.lo;
            lo = lo.wrapping_mul(0xc4ceb9fe1a85ec53);
        }
        Fingerprint { hi, lo }
    }

    /// `xor`: xor of the low words of a sequence of fingerprints. Used
    /// for the cheap pre-check in `CacheEntry::match` (§4.1).
    pub fn xor_low<'a, I: IntoIterator<Item = &'a Fingerprint>>(fps: I) -> u64 {
        fps.into_iter().fold(0u64, |acc, fp| acc ^ fp.lo)
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.hi.to_le_bytes());
        out[8..].copy_from_slice(&self.lo.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        let hi = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
        let lo = u64::from_le_bytes(bytes[8..].try_into().expect("8 bytes"));
        Fingerprint { hi, lo }
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FP({:016x}{:016x})", self.hi, self.lo)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_is_order_sensitive() {
        let a = Fingerprint::of_bytes(b"a");
        let b = Fingerprint::of_bytes(b"b");
        let ab = Fingerprint::combine([&a, &b]);
        let ba = Fingerprint::combine([&b, &a]);
        assert_ne!(ab, ba);
    }

    #[test]
    fn xor_low_matches_manual_fold() {
        let a = Fingerprint::new(1, 0b1010);
        let b = Fingerprint::new(2, 0b0110);
        assert_eq!(Fingerprint::xor_low([&a, &b]), 0b1010 ^ 0b0110);
    }

    #[test]
    fn extend_changes_value_deterministically() {
        let base = Fingerprint::of_bytes(b"instance");
        let e1 = base.extend(&42u64.to_le_bytes());
        let e2 = base.extend(&42u64.to_le_bytes());
        let e3 = base.extend(&43u64.to_le_bytes());
        assert_eq!(e1, e2);
        assert_ne!(e1, e3);
    }

    #[test]
    fn round_trip_bytes() {
        let fp = Fingerprint::of_bytes(b"round-trip");
        let bytes = fp.to_bytes();
        assert_eq!(Fingerprint::from_bytes(&bytes), fp);
    }
}
