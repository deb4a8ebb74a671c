//! Compact free-variable name list codec: a shared-prefix encoding so
//! that PKFiles with many similarly-named free variables (a common
//! shape for build-system closures, e.g. `args.cc`, `args.cflags`,
//! `args.cxx`, ...) don't pay for the common prefix on every entry.

use crate::error::{CacheError, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactNames {
    pub names: Vec<String>,
}

impl CompactNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.names.len() as u32).to_le_bytes());
        let mut prev: &str = "";
        for name in &self.names {
            let shared = prev
                .as_bytes()
                .iter()
                .zip(name.as_bytes().iter())
                .take_while(|(a, b)| a == b)
                .count();
            let suffix = &name.as_bytes()[shared..];
            out.extend_from_slice(&(shared as u16).to_le_bytes());
            out.extend_from_slice(&(suffix.len() as u16).to_le_bytes());
            out.extend_from_slice(suffix);
            prev = name;
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 4 {
            return Err(CacheError::Corruption("name list: truncated count".into()));
        }
        let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let mut off = 4;
        let mut names = Vec::with_capacity(count);
        let mut prev = String::new();
        for _ in 0..count {
            if buf.len() < off + 4 {
                return Err(CacheError::Corruption("name list: truncated entry header".into()));
            }
            let shared = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap()) as usize;
            let suffix_len = u16::from_le_bytes(buf[off + 2..off + 4].try_into().unwrap()) as usize;
            off += 4;
            if shared > prev.len() || buf.len() < off + suffix_len {
                return Err(CacheError::Corruption("name list: corrupt shared prefix".into()));
            }
            let mut name = String::with_capacity(shared + suffix_len);
            name.push_str(&prev[..shared]);
            let suffix = std::str::from_utf8(&buf[off..off + suffix_len])
                .map_err(|e| CacheError::Corruption(format!("name list: invalid utf8: {e}")))?;
            name.push_str(suffix);
            off += suffix_len;
            prev = name.clone();
            names.push(name);
        }
        Ok((Self { names }, off))
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.names.iter().position(|n| n == name).map(|i| i as u32)
    }

    pub fn push(&mut self, name: String) -> u32 {
        let idx = self.names.len() as u32;
        self.names.push(name);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_shared_prefixes() {
        let names = CompactNames {
            names: vec![
                "args.cc".to_string(),
                "args.cflags".to_string(),
                "env.PATH".to_string(),
            ],
        };
        let encoded = names.encode();
        let (decoded, used) = CompactNames::decode(&encoded).unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded, names);
    }

    #[test]
    fn empty_list_round_trips() {
        let names = CompactNames::new();
        let encoded = names.encode();
        let (decoded, _) = CompactNames::decode(&encoded).unwrap();
        assert_eq!(decoded, names);
    }
}
