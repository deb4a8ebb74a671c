//! Compact integer-to-integer map (component B), grounded on the
//! Vesta `IntIntTblLR` representation: a small map from `u32` key to
//! `u32` value that favors a narrow (16-bit) on-disk encoding when both
//! the keys and values fit, and falls back to a wide (32-bit) encoding
//! otherwise. Used for `CacheEntry::imap` (owning-PKFile `allNames`
//! index -> index into `fps`).

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// A map width chosen to minimize on-disk size for the observed key/value
/// range. Mirrors `IntIntTblLR`'s narrow/wide split.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Width {
    Narrow,
    Wide,
}

fn fits_narrow(v: u32) -> bool {
    v <= u16::MAX as u32
}

/// Compact `u32 -> u32` map. Preserves insertion order for deterministic
/// encoding; lookups are linear, which is fine at the sizes `imap`
/// reaches (bounded by a PKFile's free-variable count).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntIntMap {
    keys: Vec<u32>,
    values: Vec<u32>,
}

impl IntIntMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn get(&self, key: u32) -> Option<u32> {
        self.keys
            .iter()
            .position(|&k| k == key)
            .map(|i| self.values[i])
    }

    pub fn insert(&mut self, key: u32, value: u32) {
        if let Some(i) = self.keys.iter().position(|&k| k == key) {
            self.values[i] = value;
        } else {
            self.keys.push(key);
            self.values.push(value);
        }
    }

    pub fn remove(&mut self, key: u32) -> Option<u32> {
        self.keys.iter().position(|&k| k == key).map(|i| {
            self.keys.remove(i);
            self.values.remove(i)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.keys.iter().copied().zip(self.values.iter().copied())
    }

    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.keys.iter().copied()
    }

    fn width(&self) -> Width {
        if self
            .keys
            .iter()
            .chain(self.values.iter())
            .all(|&v| fits_narrow(v))
        {
            Width::Narrow
        } else {
            Width::Wide
        }
    }

    /// Serialize in the narrow or wide format, whichever the current
    /// contents fit. Called both when logging an `imap` to the
    /// CacheEntryExtras tail and when rewriting a stable PKFile.
    pub fn encode(&self) -> Vec<u8> {
        let width = self.width();
        let mut out = Vec::with_capacity(1 + 4 + self.keys.len() * 8);
        out.push(match width {
            Width::Narrow => 0,
            Width::Wide => 1,
        });
        out.extend_from_slice(&(self.keys.len() as u32).to_le_bytes());
        match width {
            Width::Narrow => {
                for (&k, &v) in self.keys.iter().zip(self.values.iter()) {
                    out.extend_from_slice(&(k as u16).to_le_bytes());
                    out.extend_from_slice(&(v as u16).to_le_bytes());
                }
            }
            Width::Wide => {
                for (&k, &v) in self.keys.iter().zip(self.values.iter()) {
                    out.extend_from_slice(&k.to_le_bytes());
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.is_empty() {
            return Err(CacheError::Corruption("IntIntMap: empty buffer".into()));
        }
        let width = match buf[0] {
            0 => Width::Narrow,
            1 => Width::Wide,
            other => {
                return Err(CacheError::Corruption(format!(
                    "IntIntMap: unknown width tag {other}"
                )))
            }
        };
        if buf.len() < 5 {
            return Err(CacheError::Corruption("IntIntMap: truncated header".into()));
        }
        let count = u32::from_le_bytes(buf[1..5].try_into().unwrap()) as usize;
        let entry_size = match width {
            Width::Narrow => 4,
            Width::Wide => 8,
        };
        let needed = 5 + count * entry_size;
        if buf.len() < needed {
            return Err(CacheError::Corruption("IntIntMap: truncated body".into()));
        }
        let mut keys = Vec::with_capacity(count);
        let mut values = Vec::with_capacity(count);
        let mut off = 5;
        for _ in 0..count {
            match width {
                Width::Narrow => {
                    let k = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap()) as u32;
                    let v = u16::from_le_bytes(buf[off + 2..off + 4].try_into().unwrap()) as u32;
                    keys.push(k);
                    values.push(v);
                    off += 4;
                }
                Width::Wide => {
                    let k = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
                    let v = u32::from_le_bytes(buf[off + 4..off + 8].try_into().unwrap());
                    keys.push(k);
                    values.push(v);
                    off += 8;
                }
            }
        }
        Ok((Self { keys, values }, off))
    }

    /// True identity map over `domain` (key == value for every member).
    /// `CacheEntry` drops `imap` altogether when it would be this.
    pub fn is_identity_over(&self, domain: impl IntoIterator<Item = u32>) -> bool {
        let mut seen = 0usize;
        for d in domain {
            seen += 1;
            match self.get(d) {
                Some(v) if v == d => {}
                _ => return false,
            }
        }
        seen == self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut m = IntIntMap::new();
        m.insert(3, 100);
        m.insert(7, 200);
        assert_eq!(m.get(3), Some(100));
        assert_eq!(m.get(7), Some(200));
        assert_eq!(m.remove(3), Some(100));
        assert_eq!(m.get(3), None);
    }

    #[test]
    fn narrow_round_trip() {
        let mut m = IntIntMap::new();
        m.insert(1, 2);
        m.insert(5, 9);
        let bytes = m.encode();
        assert_eq!(bytes[0], 0); // narrow
        let (decoded, used) = IntIntMap::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, m);
    }

    #[test]
    fn wide_round_trip_when_value_exceeds_u16() {
        let mut m = IntIntMap::new();
        m.insert(1, 70_000);
        let bytes = m.encode();
        assert_eq!(bytes[0], 1); // wide
        let (decoded, _) = IntIntMap::decode(&bytes).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn identity_detection() {
        let mut m = IntIntMap::new();
        m.insert(0, 0);
        m.insert(1, 1);
        assert!(m.is_identity_over([0, 1]));
        m.insert(2, 5);
        assert!(!m.is_identity_over([0, 1, 2]));
    }
}
