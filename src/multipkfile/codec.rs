//! On-disk MultiPKFile layout, per spec.md §4.4: version word, magic,
//! PKFile count, total length (back-patched), header-type tag, header
//! entries `{pk, offset}`, then the PKFiles in header order.

use crate::error::{CacheError, Result};
use crate::fp::Fingerprint;
use crate::pkfile::stable::{CfpHeaderType, StablePKFile};

pub const MULTIPKFILE_VERSION: u32 = 1;
pub const MULTIPKFILE_MAGIC: u32 = 0x5643_4846; // "VCHF"

#[derive(Clone, Copy, Debug)]
pub struct HeaderEntry {
    pub pk: Fingerprint,
    pub offset: u64,
}

/// A group of PKFiles sharing a prefix, held together on disk so a
/// single rename publishes all of them at once (§4.5).
#[derive(Clone, Debug, Default)]
pub struct MultiPKFile {
    pub pkfiles: Vec<StablePKFile>,
}

impl MultiPKFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pkfiles.is_empty()
    }

    pub fn find(&self, pk: &Fingerprint) -> Option<&StablePKFile> {
        if self.pkfiles.len() >= crate::pkfile::stable::BINARY_SEARCH_THRESHOLD {
            self.pkfiles.binary_search_by(|p| p.pk.cmp(pk)).ok().map(|i| &self.pkfiles[i])
        } else {
            self.pkfiles.iter().find(|p| &p.pk == pk)
        }
    }

    pub fn find_mut(&mut self, pk: &Fingerprint) -> Option<&mut StablePKFile> {
        self.pkfiles.iter_mut().find(|p| &p.pk == pk)
    }

    fn header_type(&self) -> CfpHeaderType {
        if self.pkfiles.len() >= crate::pkfile::stable::BINARY_SEARCH_THRESHOLD {
            CfpHeaderType::SortedList
        } else {
            CfpHeaderType::List
        }
    }

    /// Encode the full file: header + PKFile bodies. Keeps PKFiles in
    /// sorted-pk order whenever the header will be a sorted list, so
    /// the binary search at read time is valid.
    pub fn encode(&self) -> Vec<u8> {
        let header_type = self.header_type();
        let mut ordered: Vec<&StablePKFile> = self.pkfiles.iter().collect();
        if matches!(header_type, CfpHeaderType::SortedList) {
            ordered.sort_by(|a, b| a.pk.cmp(&b.pk));
        }

        let bodies: Vec<Vec<u8>> = ordered.iter().map(|p| p.encode()).collect();

        let mut out = Vec::new();
        out.extend_from_slice(&MULTIPKFILE_VERSION.to_le_bytes());
        out.extend_from_slice(&MULTIPKFILE_MAGIC.to_le_bytes());
        out.extend_from_slice(&(ordered.len() as u32).to_le_bytes());

        // total_length placeholder, back-patched below.
        let total_len_pos = out.len();
        out.extend_from_slice(&0u64.to_le_bytes());

        out.push(match header_type {
            CfpHeaderType::List => 0,
            CfpHeaderType::SortedList => 1,
        });

        // Header entries: offsets are relative to the start of the
        // PKFile body region, back-patched once body lengths are known.
        let header_entries_pos = out.len();
        for p in &ordered {
            out.extend_from_slice(&p.pk.to_bytes());
            out.extend_from_slice(&0u64.to_le_bytes()); // offset placeholder
        }

        let body_start = out.len();
        let mut offsets = Vec::with_capacity(bodies.len());
        for body in &bodies {
            offsets.push((out.len() - body_start) as u64);
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(body);
        }

        for (i, off) in offsets.iter().enumerate() {
            let pos = header_entries_pos + i * 24 + 16;
            out[pos..pos + 8].copy_from_slice(&off.to_le_bytes());
        }

        let total_len = out.len() as u64;
        out[total_len_pos..total_len_pos + 8].copy_from_slice(&total_len.to_le_bytes());

        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 + 4 + 4 + 8 + 1 {
            return Err(CacheError::Corruption("multipkfile: truncated header".into()));
        }
        let version = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if version != MULTIPKFILE_VERSION {
            return Err(CacheError::Corruption(format!("multipkfile: unsupported version {version}")));
        }
        let magic = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if magic != MULTIPKFILE_MAGIC {
            return Err(CacheError::Corruption("multipkfile: bad magic".into()));
        }
        let count = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        let total_len = u64::from_le_bytes(buf[12..20].try_into().unwrap()) as usize;
        if buf.len() != total_len {
            return Err(CacheError::Corruption(format!(
                "multipkfile: length mismatch, header says {total_len}, got {}",
                buf.len()
            )));
        }
        let header_type = match buf[20] {
            0 => CfpHeaderType::List,
            1 => CfpHeaderType::SortedList,
            other => return Err(CacheError::Corruption(format!("multipkfile: unknown header type {other}"))),
        };

        let mut off = 21;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.len() < off + 24 {
                return Err(CacheError::Corruption("multipkfile: truncated header entry".into()));
            }
            let pk_bytes: [u8; 16] = buf[off..off + 16].try_into().unwrap();
            let pk = Fingerprint::from_bytes(&pk_bytes);
            let entry_off = u64::from_le_bytes(buf[off + 16..off + 24].try_into().unwrap());
            entries.push(HeaderEntry { pk, offset: entry_off });
            off += 24;
        }
        if matches!(header_type, CfpHeaderType::SortedList) {
            for w in entries.windows(2) {
                if w[0].pk > w[1].pk {
                    return Err(CacheError::Corruption("multipkfile: sorted-list header not sorted".into()));
                }
            }
        }

        let body_start = off;
        let mut pkfiles = Vec::with_capacity(count);
        for entry in &entries {
            let start = body_start + entry.offset as usize;
            if buf.len() < start + 4 {
                return Err(CacheError::Corruption("multipkfile: truncated body length".into()));
            }
            let body_len = u32::from_le_bytes(buf[start..start + 4].try_into().unwrap()) as usize;
            let body_start_inner = start + 4;
            if buf.len() < body_start_inner + body_len {
                return Err(CacheError::Corruption("multipkfile: truncated body".into()));
            }
            let (pkf, used) = StablePKFile::decode(&buf[body_start_inner..body_start_inner + body_len])?;
            debug_assert!(used <= body_len);
            if pkf.pk != entry.pk {
                return Err(CacheError::Corruption("multipkfile: body pk doesn't match header entry".into()));
            }
            pkfiles.push(pkf);
        }

        Ok(Self { pkfiles })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::NameSet;
    use crate::entry::CacheEntry;
    use crate::pkfile::CfpGroup;

    fn fp(b: u8) -> Fingerprint {
        Fingerprint::of_bytes(&[b])
    }

    fn one_pkfile(pk: Fingerprint, ci: u32) -> StablePKFile {
        let mut pkf = StablePKFile::empty(pk);
        pkf.common_names = NameSet::from_indices([0]);
        let uncommon = NameSet::new();
        let e = CacheEntry::new(ci, pk, 0, vec![1, 2, 3], vec![], vec![fp(9)], None, uncommon);
        let key = e.combine_fp(&pkf.common_names);
        pkf.groups.push(CfpGroup {
            common_fp: key,
            entries: vec![e],
        });
        pkf
    }

    #[test]
    fn round_trips_multiple_pkfiles() {
        let mut mpk = MultiPKFile::new();
        mpk.pkfiles.push(one_pkfile(fp(1), 10));
        mpk.pkfiles.push(one_pkfile(fp(2), 20));
        let bytes = mpk.encode();
        let decoded = MultiPKFile::decode(&bytes).unwrap();
        assert_eq!(decoded.pkfiles.len(), 2);
        assert!(decoded.find(&fp(1)).is_some());
        assert!(decoded.find(&fp(2)).is_some());
        assert!(decoded.find(&fp(3)).is_none());
    }

    #[test]
    fn rejects_truncated_buffer() {
        let mut mpk = MultiPKFile::new();
        mpk.pkfiles.push(one_pkfile(fp(1), 10));
        let bytes = mpk.encode();
        let truncated = &bytes[..bytes.len() - 5];
        assert!(MultiPKFile::decode(truncated).is_err());
    }
}
