//! Dense bit set over name indices (component A).
//!
//! Backs `common_names`, `uncommon_names`, and the various derived sets
//! computed during a `SPKFile::update` rewrite (the join/meet over
//! surviving entries' name sets, and the mask of names still
//! referenced). Dense rather than sparse because PKFiles rarely carry
//! more than a few hundred free variables; a `Vec<u64>` word vector
//! keeps `pack`/`remap` linear and branch-free.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameSet {
    words: Vec<u64>,
}

const BITS: usize = 64;

impl NameSet {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    pub fn with_capacity(bits: usize) -> Self {
        Self {
            words: vec![0u64; bits.div_ceil(BITS)],
        }
    }

    fn ensure_capacity(&mut self, idx: usize) {
        let needed = idx / BITS + 1;
        if self.words.len() < needed {
            self.words.resize(needed, 0);
        }
    }

    pub fn set(&mut self, idx: u32) {
        let idx = idx as usize;
        self.ensure_capacity(idx);
        self.words[idx / BITS] |= 1u64 << (idx % BITS);
    }

    pub fn clear_bit(&mut self, idx: u32) {
        let idx = idx as usize;
        if idx / BITS < self.words.len() {
            self.words[idx / BITS] &= !(1u64 << (idx % BITS));
        }
    }

    pub fn test(&self, idx: u32) -> bool {
        let idx = idx as usize;
        self.words
            .get(idx / BITS)
            .is_some_and(|w| w & (1u64 << (idx % BITS)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Ascending iteration over set bit indices -- the order required
    /// everywhere the spec says "ascending" (combine_fp, imap domain).
    pub fn iter_ascending(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            (0..BITS).filter_map(move |b| {
                if w & (1u64 << b) != 0 {
                    Some((wi * BITS + b) as u32)
                } else {
                    None
                }
            })
        })
    }

    pub fn is_subset_of(&self, other: &NameSet) -> bool {
        self.iter_ascending().all(|b| other.test(b))
    }

    pub fn union(&self, other: &NameSet) -> NameSet {
        let len = self.words.len().max(other.words.len());
        let mut out = vec![0u64; len];
        for i in 0..len {
            let a = self.words.get(i).copied().unwrap_or(0);
            let b = other.words.get(i).copied().unwrap_or(0);
            out[i] = a | b;
        }
        NameSet { words: out }
    }

    pub fn intersection(&self, other: &NameSet) -> NameSet {
        let len = self.words.len().min(other.words.len());
        let mut out = vec![0u64; len];
        for i in 0..len {
            out[i] = self.words[i] & other.words[i];
        }
        NameSet { words: out }
    }

    pub fn difference(&self, other: &NameSet) -> NameSet {
        let mut out = self.clone();
        for b in other.iter_ascending() {
            out.clear_bit(b);
        }
        out
    }

    /// Build the set of surviving indices (`mask`) and the old->new
    /// remap table used when a rewrite packs `all_names`, dropping
    /// indices outside `mask` and shifting the rest down to stay
    /// dense. Order-preserving: a surviving index's relative order is
    /// unchanged (§4.3 step 3 "stable-order-preserving").
    pub fn pack_remap(&self) -> (NameSet, Vec<Option<u32>>) {
        let max_idx = self.words.len() * BITS;
        let mut remap = vec![None; max_idx];
        let mut next = 0u32;
        let mut mask = NameSet::new();
        for old in self.iter_ascending() {
            remap[old as usize] = Some(next);
            mask.set(next);
            next += 1;
        }
        (mask, remap)
    }

    /// Apply a remap table (as produced by `pack_remap`, or extended to
    /// cover names added since) to this set, dropping any bit whose
    /// remap entry is `None`.
    pub fn remap(&self, remap: &[Option<u32>]) -> NameSet {
        let mut out = NameSet::new();
        for old in self.iter_ascending() {
            if let Some(Some(new)) = remap.get(old as usize) {
                out.set(*new);
            }
        }
        out
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.iter_ascending().collect()
    }

    pub fn from_indices<I: IntoIterator<Item = u32>>(indices: I) -> Self {
        let mut s = NameSet::new();
        for i in indices {
            s.set(i);
        }
        s
    }

    /// Word-vector encoding: word count, then each word LE. Used
    /// wherever a PKFile persists `common_names`/`uncommon_names`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.words.len() * 8);
        out.extend_from_slice(&(self.words.len() as u32).to_le_bytes());
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> crate::error::Result<(Self, usize)> {
        if buf.len() < 4 {
            return Err(crate::error::CacheError::Corruption("name set: truncated count".into()));
        }
        let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let mut off = 4;
        if buf.len() < off + count * 8 {
            return Err(crate::error::CacheError::Corruption("name set: truncated words".into()));
        }
        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            words.push(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
            off += 8;
        }
        Ok((Self { words }, off))
    }
}
