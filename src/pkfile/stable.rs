//! Stable PKFile: the on-disk layout described in spec.md §4.3/§6, and
//! the `update` transform a MultiPKFile rewrite applies to it.

use crate::bitset::NameSet;
use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::fp::Fingerprint;
use crate::intintmap::IntIntMap;
use crate::pkfile::names::CompactNames;

/// CFP (common-fingerprint) header selector. Only `List` and
/// `SortedList` are implemented, per spec.md §4.3 ("only list and
/// sorted-list are implemented").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfpHeaderType {
    List = 0,
    SortedList = 1,
}

/// Threshold at which the header switches from linear scan to binary
/// search, per §4.3 "binary search when >= 8 groups, else linear".
pub const BINARY_SEARCH_THRESHOLD: usize = 8;

#[derive(Clone, Debug)]
pub struct CfpGroup {
    pub common_fp: Fingerprint,
    pub entries: Vec<CacheEntry>,
}

/// A PKFile on disk: one PK's entries, grouped by common fingerprint.
#[derive(Clone, Debug)]
pub struct StablePKFile {
    pub pk: Fingerprint,
    pub source_func: String,
    pub pk_epoch: u32,
    pub names_epoch: u32,
    pub all_names: CompactNames,
    pub common_names: NameSet,
    pub header_type: CfpHeaderType,
    pub groups: Vec<CfpGroup>,
}

impl StablePKFile {
    pub fn empty(pk: Fingerprint) -> Self {
        Self {
            pk,
            source_func: String::new(),
            pk_epoch: 0,
            names_epoch: 0,
            all_names: CompactNames::new(),
            common_names: NameSet::new(),
            header_type: CfpHeaderType::List,
            groups: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.entries.is_empty())
    }

    fn choose_header_type(count: usize) -> CfpHeaderType {
        if count >= BINARY_SEARCH_THRESHOLD {
            CfpHeaderType::SortedList
        } else {
            CfpHeaderType::List
        }
    }

    /// Locate the group for a common fingerprint, per §4.3 "Lookup on
    /// disk": binary search when the header is sorted and has enough
    /// groups, else linear scan.
    pub fn find_group(&self, common_fp: &Fingerprint) -> Option<&CfpGroup> {
        match self.header_type {
            CfpHeaderType::SortedList if self.groups.len() >= BINARY_SEARCH_THRESHOLD => self
                .groups
                .binary_search_by(|g| g.common_fp.cmp(common_fp))
                .ok()
                .map(|i| &self.groups[i]),
            _ => self.groups.iter().find(|g| &g.common_fp == common_fp),
        }
    }

    /// Scan a group for the first entry whose uncommon fingerprints
    /// match the request.
    pub fn find_entry(&self, common_fp: &Fingerprint, request_fps: &[Fingerprint]) -> Option<&CacheEntry> {
        self.find_group(common_fp)
            .and_then(|g| g.entries.iter().find(|e| e.matches(request_fps)))
    }

    fn rebuild_groups(entries: Vec<CacheEntry>, common_names: &NameSet, header_type: CfpHeaderType) -> Vec<CfpGroup> {
        let mut groups: Vec<CfpGroup> = Vec::new();
        for e in entries {
            let key = e.combine_fp(common_names);
            if let Some(g) = groups.iter_mut().find(|g| g.common_fp == key) {
                g.entries.push(e);
            } else {
                groups.push(CfpGroup {
                    common_fp: key,
                    entries: vec![e],
                });
            }
        }
        if matches!(header_type, CfpHeaderType::SortedList) {
            groups.sort_by(|a, b| a.common_fp.cmp(&b.common_fp));
        }
        groups
    }

    /// `update(chkpt, to_delete)`, per spec.md §4.3. `survivors` is every
    /// entry that should remain after applying `to_delete` (callers
    /// build this from the current on-disk entries plus the flushed
    /// checkpoint's new entries, minus anything whose CI is in
    /// `to_delete`). Returns the fields listed in §4.3 plus mutates
    /// `self` in place to the new stable state.
    pub fn update(&mut self, survivors: Vec<CacheEntry>, next_pk_epoch: u32) -> UpdateOutcome {
        if survivors.is_empty() {
            let became_empty_mask = self.common_names.clone();
            *self = StablePKFile::empty(self.pk);
            self.pk_epoch = next_pk_epoch;
            return UpdateOutcome {
                changed: true,
                ex_common: NameSet::new(),
                ex_uncommon: NameSet::new(),
                mask: NameSet::new(),
                remap: vec![None; became_empty_mask.count().max(1)],
                became_empty: true,
            };
        }

        // Step 1: join (names referenced by any survivor) and meet
        // (names referenced by every survivor).
        let mut join = NameSet::new();
        let mut meet: Option<NameSet> = None;
        for e in &survivors {
            let referenced = self.common_names.union(&e.uncommon_names);
            // An entry's referenced set, reconstructed from its
            // uncommon_names: if it is "common" (covers common_names)
            // this equals common ∪ uncommon; we treat that as its
            // referenced set uniformly (see DESIGN.md's resolution of
            // the fps.len invariant for non-common entries).
            join = join.union(&referenced);
            meet = Some(match meet {
                None => referenced,
                Some(m) => m.intersection(&referenced),
            });
        }
        let new_common = meet.unwrap_or_default();

        // Step 2: ex_common (now-uncommon) / ex_uncommon (now-common)
        // relative to the previous common_names.
        let ex_common = self.common_names.difference(&new_common);
        let ex_uncommon = new_common.difference(&self.common_names);

        // Step 3: mask/remap over the join (names still referenced).
        let (mask, remap) = join.pack_remap();

        // Step 4: apply update() to every surviving entry, re-keying
        // and unlazying its tag.
        let mut updated = Vec::with_capacity(survivors.len());
        for mut e in survivors {
            e.update(&ex_common, &ex_uncommon, &mask, &remap);
            e.unlazy_tag();
            updated.push(e);
        }

        // Step 5: pack all_names/common_names; bump names_epoch if the
        // mask actually dropped or renumbered anything.
        let old_name_count = self.all_names.len();
        let names_changed = remap.iter().enumerate().any(|(i, r)| {
            if i >= old_name_count {
                false
            } else {
                *r != Some(i as u32)
            }
        }) || join.count() < old_name_count;

        let mut new_names = CompactNames::new();
        for old_idx in join.iter_ascending() {
            if let Some(name) = self.all_names.names.get(old_idx as usize) {
                new_names.push(name.clone());
            } else {
                new_names.push(format!("$name{old_idx}"));
            }
        }
        self.all_names = new_names;
        self.common_names = new_common.remap(&remap);

        let header_type = Self::choose_header_type(updated.len());
        self.groups = Self::rebuild_groups(updated, &self.common_names, header_type);
        self.header_type = header_type;

        if names_changed {
            self.names_epoch += 1;
        }
        self.pk_epoch = next_pk_epoch;

        UpdateOutcome {
            changed: true,
            ex_common,
            ex_uncommon,
            mask,
            remap,
            became_empty: false,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.groups.iter().map(|g| g.entries.len()).sum()
    }

    /// Encode one `CacheEntry` (the "uncommon" half only -- `ci`, the
    /// xor word, the optional cached combine, and the extras tail).
    fn encode_entry(e: &CacheEntry) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&e.ci.to_le_bytes());
        out.extend_from_slice(&e.model.to_le_bytes());
        out.extend_from_slice(&(e.value.len() as u32).to_le_bytes());
        out.extend_from_slice(&e.value);
        out.extend_from_slice(&(e.kids.len() as u32).to_le_bytes());
        for k in &e.kids {
            out.extend_from_slice(&k.to_le_bytes());
        }
        out.extend_from_slice(&e.uncommon_tag.xor_word.to_le_bytes());
        match e.uncommon_tag.cached_fp() {
            Some(fp) => {
                out.push(1);
                out.extend_from_slice(&fp.to_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&e.uncommon_names.encode());
        out.extend_from_slice(&encode_entry_extras(e));
        out
    }

    fn decode_entry(pk: Fingerprint, buf: &[u8]) -> Result<(CacheEntry, usize)> {
        if buf.len() < 4 + 8 + 4 {
            return Err(CacheError::Corruption("entry: truncated header".into()));
        }
        let ci = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let model = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let value_len = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
        let mut off = 16;
        if buf.len() < off + value_len {
            return Err(CacheError::Corruption("entry: truncated value".into()));
        }
        let value = buf[off..off + value_len].to_vec();
        off += value_len;

        if buf.len() < off + 4 {
            return Err(CacheError::Corruption("entry: truncated kids length".into()));
        }
        let kid_count = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        let mut kids = Vec::with_capacity(kid_count);
        for _ in 0..kid_count {
            if buf.len() < off + 4 {
                return Err(CacheError::Corruption("entry: truncated kid".into()));
            }
            kids.push(u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()));
            off += 4;
        }

        if buf.len() < off + 8 + 1 {
            return Err(CacheError::Corruption("entry: truncated xor/tag".into()));
        }
        let xor_word = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let has_cached = buf[off];
        off += 1;
        let cached_fp = if has_cached == 1 {
            if buf.len() < off + 16 {
                return Err(CacheError::Corruption("entry: truncated cached fp".into()));
            }
            let bytes: [u8; 16] = buf[off..off + 16].try_into().unwrap();
            off += 16;
            Some(Fingerprint::from_bytes(&bytes))
        } else {
            None
        };

        let (uncommon_names, used) = NameSet::decode(&buf[off..])?;
        off += used;

        let (imap, fps, used) = decode_entry_extras(&buf[off..])?;
        off += used;

        Ok((
            CacheEntry::from_decoded(ci, pk, model, value, kids, fps, imap, uncommon_names, xor_word, cached_fp),
            off,
        ))
    }

    /// Full on-disk layout for one PKFile, per spec.md §6: pk,
    /// source_func, epochs, all_names, common_names, header type, then
    /// groups of (common_fp, entry count, entries).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.pk.to_bytes());
        let func_bytes = self.source_func.as_bytes();
        out.extend_from_slice(&(func_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(func_bytes);
        out.extend_from_slice(&self.pk_epoch.to_le_bytes());
        out.extend_from_slice(&self.names_epoch.to_le_bytes());
        out.extend_from_slice(&self.all_names.encode());
        out.extend_from_slice(&self.common_names.encode());
        out.push(match self.header_type {
            CfpHeaderType::List => 0,
            CfpHeaderType::SortedList => 1,
        });
        out.extend_from_slice(&(self.groups.len() as u32).to_le_bytes());
        for g in &self.groups {
            out.extend_from_slice(&g.common_fp.to_bytes());
            out.extend_from_slice(&(g.entries.len() as u32).to_le_bytes());
            for e in &g.entries {
                let bytes = Self::encode_entry(e);
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(&bytes);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 16 {
            return Err(CacheError::Corruption("pkfile: truncated pk".into()));
        }
        let pk_bytes: [u8; 16] = buf[0..16].try_into().unwrap();
        let pk = Fingerprint::from_bytes(&pk_bytes);
        let mut off = 16;

        if buf.len() < off + 4 {
            return Err(CacheError::Corruption("pkfile: truncated source_func length".into()));
        }
        let func_len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        if buf.len() < off + func_len {
            return Err(CacheError::Corruption("pkfile: truncated source_func".into()));
        }
        let source_func = std::str::from_utf8(&buf[off..off + func_len])
            .map_err(|e| CacheError::Corruption(format!("pkfile: invalid source_func utf8: {e}")))?
            .to_string();
        off += func_len;

        if buf.len() < off + 8 {
            return Err(CacheError::Corruption("pkfile: truncated epochs".into()));
        }
        let pk_epoch = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        let names_epoch = u32::from_le_bytes(buf[off + 4..off + 8].try_into().unwrap());
        off += 8;

        let (all_names, used) = CompactNames::decode(&buf[off..])?;
        off += used;
        let (common_names, used) = NameSet::decode(&buf[off..])?;
        off += used;

        if buf.len() < off + 1 + 4 {
            return Err(CacheError::Corruption("pkfile: truncated header".into()));
        }
        let header_type = match buf[off] {
            0 => CfpHeaderType::List,
            1 => CfpHeaderType::SortedList,
            other => return Err(CacheError::Corruption(format!("pkfile: unknown header type {other}"))),
        };
        off += 1;
        let group_count = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        off += 4;

        let mut groups = Vec::with_capacity(group_count);
        for _ in 0..group_count {
            if buf.len() < off + 16 + 4 {
                return Err(CacheError::Corruption("pkfile: truncated group header".into()));
            }
            let fp_bytes: [u8; 16] = buf[off..off + 16].try_into().unwrap();
            let common_fp = Fingerprint::from_bytes(&fp_bytes);
            off += 16;
            let entry_count = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            let mut entries = Vec::with_capacity(entry_count);
            for _ in 0..entry_count {
                if buf.len() < off + 4 {
                    return Err(CacheError::Corruption("pkfile: truncated entry length".into()));
                }
                let entry_len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
                off += 4;
                if buf.len() < off + entry_len {
                    return Err(CacheError::Corruption("pkfile: truncated entry body".into()));
                }
                let (entry, used) = Self::decode_entry(pk, &buf[off..off + entry_len])?;
                debug_assert!(used <= entry_len);
                entries.push(entry);
                off += entry_len;
            }
            groups.push(CfpGroup { common_fp, entries });
        }

        Ok((
            Self {
                pk,
                source_func,
                pk_epoch,
                names_epoch,
                all_names,
                common_names,
                header_type,
                groups,
            },
            off,
        ))
    }
}

/// Result of `StablePKFile::update`, per §4.3.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub changed: bool,
    pub ex_common: NameSet,
    pub ex_uncommon: NameSet,
    pub mask: NameSet,
    pub remap: Vec<Option<u32>>,
    pub became_empty: bool,
}

/// Minimal imap-free byte codec for a single `CacheEntry`'s "extras"
/// tail (`imap` + `fps`), per the `CFPGroup` layout in spec.md §6.
pub fn encode_entry_extras(e: &CacheEntry) -> Vec<u8> {
    let mut out = Vec::new();
    let imap_bytes = e.imap.as_ref().map(|m| m.encode()).unwrap_or_default();
    out.extend_from_slice(&(imap_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&imap_bytes);
    out.extend_from_slice(&(e.fps.len() as u32).to_le_bytes());
    for fp in &e.fps {
        out.extend_from_slice(&fp.to_bytes());
    }
    out
}

pub fn decode_entry_extras(buf: &[u8]) -> Result<(Option<IntIntMap>, Vec<Fingerprint>, usize)> {
    if buf.len() < 4 {
        return Err(CacheError::Corruption("entry extras: truncated imap length".into()));
    }
    let imap_len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let mut off = 4;
    let imap = if imap_len == 0 {
        None
    } else {
        let (m, _) = IntIntMap::decode(&buf[off..off + imap_len])?;
        Some(m)
    };
    off += imap_len;
    if buf.len() < off + 4 {
        return Err(CacheError::Corruption("entry extras: truncated fps length".into()));
    }
    let fp_count = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
    off += 4;
    let mut fps = Vec::with_capacity(fp_count);
    for _ in 0..fp_count {
        if buf.len() < off + 16 {
            return Err(CacheError::Corruption("entry extras: truncated fp".into()));
        }
        let bytes: [u8; 16] = buf[off..off + 16].try_into().unwrap();
        fps.push(Fingerprint::from_bytes(&bytes));
        off += 16;
    }
    Ok((imap, fps, off))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(b: u8) -> Fingerprint {
        Fingerprint::of_bytes(&[b])
    }

    fn mk_entry(ci: u32, names: &[u32], fps: Vec<Fingerprint>, common: &NameSet) -> CacheEntry {
        let name_set = NameSet::from_indices(names.iter().copied());
        let uncommon = name_set.difference(common);
        CacheEntry::new(ci, Fingerprint::ZERO, 0, vec![], vec![], fps, None, uncommon)
    }

    #[test]
    fn find_entry_linear_then_binary() {
        let mut pkf = StablePKFile::empty(Fingerprint::ZERO);
        pkf.common_names = NameSet::from_indices([0]);
        let e = mk_entry(1, &[0, 1], vec![fp(10), fp(20)], &pkf.common_names);
        let key = e.combine_fp(&pkf.common_names);
        pkf.groups.push(CfpGroup {
            common_fp: key,
            entries: vec![e],
        });
        let found = pkf.find_entry(&key, &[fp(10), fp(20)]);
        assert!(found.is_some());
        assert_eq!(found.unwrap().ci, 1);
    }

    #[test]
    fn update_drops_deleted_and_repacks_names() {
        let mut pkf = StablePKFile::empty(Fingerprint::ZERO);
        pkf.all_names = CompactNames {
            names: vec!["a".into(), "b".into(), "c".into()],
        };
        pkf.common_names = NameSet::from_indices([0]);
        let e1 = mk_entry(1, &[0, 1], vec![fp(1), fp(2)], &pkf.common_names);
        let e2 = mk_entry(2, &[0, 2], vec![fp(1), fp(3)], &pkf.common_names);
        // name 1 ("b") only referenced by e1; if e1 is deleted, "b"
        // disappears from the join and the names list should shrink.
        let outcome = pkf.update(vec![e2], 5);
        assert!(outcome.changed);
        assert!(!outcome.became_empty);
        assert_eq!(pkf.pk_epoch, 5);
        assert_eq!(pkf.all_names.len(), 2);
        assert_eq!(pkf.entry_count(), 1);
        let _ = e1;
    }

    #[test]
    fn update_with_no_survivors_marks_empty() {
        let mut pkf = StablePKFile::empty(Fingerprint::ZERO);
        let outcome = pkf.update(vec![], 9);
        assert!(outcome.became_empty);
        assert_eq!(pkf.pk_epoch, 9);
        assert!(pkf.is_empty());
    }

    #[test]
    fn encode_decode_round_trips() {
        let mut pkf = StablePKFile::empty(fp(1));
        pkf.source_func = "//foo.bar/build.model".to_string();
        pkf.pk_epoch = 3;
        pkf.names_epoch = 1;
        pkf.all_names = CompactNames {
            names: vec!["a".into(), "b".into()],
        };
        pkf.common_names = NameSet::from_indices([0]);
        let e = mk_entry(7, &[0, 1], vec![fp(5), fp(6)], &pkf.common_names);
        let key = e.combine_fp(&pkf.common_names);
        pkf.groups.push(CfpGroup {
            common_fp: key,
            entries: vec![e],
        });

        let bytes = pkf.encode();
        let (decoded, used) = StablePKFile::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded.pk, pkf.pk);
        assert_eq!(decoded.source_func, pkf.source_func);
        assert_eq!(decoded.pk_epoch, pkf.pk_epoch);
        assert_eq!(decoded.names_epoch, pkf.names_epoch);
        assert_eq!(decoded.all_names, pkf.all_names);
        assert_eq!(decoded.entry_count(), 1);
        assert!(decoded.find_entry(&key, &[fp(5), fp(6)]).is_some());
    }
}
