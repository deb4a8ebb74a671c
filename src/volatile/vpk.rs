//! Component F: Volatile PKFile -- the in-memory working set for one
//! PK (spec.md §3, §4.2).

use std::collections::HashMap;

use crate::bitset::NameSet;
use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::fp::Fingerprint;
use crate::intintmap::IntIntMap;
use crate::pkfile::stable::StablePKFile;

/// Practical ceiling on a PKFile's free-variable count, matching the
/// narrow `IntIntMap` encoding's key width. Insertions past this limit
/// fail as `TooManyNames` rather than silently falling back to the
/// wide encoding for every entry's imap.
pub const MAX_NAMES: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupClass {
    New,
    Warm,
    Disk,
}

#[derive(Debug)]
pub enum LookupOutcome {
    Hit {
        ci: u32,
        value: Vec<u8>,
        class: LookupClass,
    },
    Miss,
}

/// A built-but-not-yet-placed entry, returned by `new_entry`.
pub struct PendingEntry {
    pub entry: CacheEntry,
    pub common: bool,
    pub key: Fingerprint,
}

/// Snapshot of what the next flush will write for one VPK, per §4.2
/// "Checkpoint". Entries are deep-copied because the originals keep
/// living (and mutating their lazy tag) in `new_common`/`new_uncommon`
/// until `update` truncates them out.
pub struct VpkChkpt {
    pub pk: Fingerprint,
    pub names_epoch: u32,
    pub all_names_len: usize,
    pub pk_epoch: u32,
    pub new_common_heads: HashMap<Fingerprint, usize>,
    pub new_uncommon_head: usize,
    pub flushed_entries: Vec<CacheEntry>,
    pub has_new_entries: bool,
}

#[derive(Debug, Clone)]
pub struct VolatilePKFile {
    pub pk: Fingerprint,
    pub source_func: Option<String>,
    pub pk_epoch: u32,
    pub names_epoch: u32,
    pub all_names: Vec<String>,
    pub name_index: HashMap<String, u32>,
    pub common_names: NameSet,
    pub warm: HashMap<Fingerprint, Vec<CacheEntry>>,
    pub new_common: HashMap<Fingerprint, Vec<CacheEntry>>,
    pub new_uncommon: Vec<CacheEntry>,
    pub is_stable_empty: bool,
    pub evicted: bool,
    pub free_epoch: i32,
}

impl VolatilePKFile {
    pub fn new(pk: Fingerprint) -> Self {
        Self {
            pk,
            source_func: None,
            pk_epoch: 0,
            names_epoch: 0,
            all_names: Vec::new(),
            name_index: HashMap::new(),
            common_names: NameSet::new(),
            warm: HashMap::new(),
            new_common: HashMap::new(),
            new_uncommon: Vec::new(),
            is_stable_empty: true,
            evicted: false,
            free_epoch: 0,
        }
    }

    /// Rehydrate from a decoded stable PKFile (first reference after a
    /// restart, or an eviction followed by a fresh lookup).
    pub fn from_stable(stable: &StablePKFile) -> Self {
        let mut name_index = HashMap::new();
        for (i, name) in stable.all_names.names.iter().enumerate() {
            name_index.insert(name.clone(), i as u32);
        }
        let mut warm = HashMap::new();
        for g in &stable.groups {
            warm.insert(g.common_fp, g.entries.clone());
        }
        Self {
            pk: stable.pk,
            source_func: if stable.source_func.is_empty() {
                None
            } else {
                Some(stable.source_func.clone())
            },
            pk_epoch: stable.pk_epoch,
            names_epoch: stable.names_epoch,
            all_names: stable.all_names.names.clone(),
            name_index,
            common_names: stable.common_names.clone(),
            warm,
            new_common: HashMap::new(),
            new_uncommon: Vec::new(),
            is_stable_empty: stable.is_empty(),
            evicted: false,
            free_epoch: 0,
        }
    }

    fn request_name_set(&self, names: &[u32]) -> NameSet {
        NameSet::from_indices(names.iter().copied())
    }

    /// §4.2 "Lookup": `id` is the requester's epoch, `fps` in requester
    /// order (aligned with `all_names` -- see `new_entry` for how a
    /// requester discovers indices).
    pub fn lookup(&self, id: u32, fps: &[Fingerprint]) -> Result<LookupOutcome> {
        if id > self.names_epoch {
            return Err(CacheError::BadLookupArgs(format!(
                "epoch {id} ahead of current names_epoch {}",
                self.names_epoch
            )));
        }
        if id < self.names_epoch {
            return Err(CacheError::FVMismatch {
                client: id,
                current: self.names_epoch,
            });
        }
        if fps.len() != self.all_names.len() {
            return Err(CacheError::BadLookupArgs(format!(
                "fps length {} does not match all_names length {}",
                fps.len(),
                self.all_names.len()
            )));
        }

        let common_fp = self.combine_over(&self.common_names, fps);

        if let Some(list) = self.new_common.get(&common_fp) {
            if let Some(e) = list.iter().find(|e| e.matches(fps)) {
                return Ok(LookupOutcome::Hit {
                    ci: e.ci,
                    value: e.value.clone(),
                    class: LookupClass::New,
                });
            }
        }
        if let Some(e) = self.new_uncommon.iter().find(|e| e.matches(fps)) {
            return Ok(LookupOutcome::Hit {
                ci: e.ci,
                value: e.value.clone(),
                class: LookupClass::New,
            });
        }
        if let Some(list) = self.warm.get(&common_fp) {
            if let Some(e) = list.iter().find(|e| e.matches(fps)) {
                return Ok(LookupOutcome::Hit {
                    ci: e.ci,
                    value: e.value.clone(),
                    class: LookupClass::Warm,
                });
            }
        }
        Ok(LookupOutcome::Miss)
    }

    /// Install a disk hit into `warm`, per §4.2 step 6.
    pub fn install_disk_hit(&mut self, common_fp: Fingerprint, entry: CacheEntry) {
        self.warm.entry(common_fp).or_default().push(entry);
    }

    /// The common-fingerprint a disk lookup should search for, given
    /// this VPK's current `common_names` -- exposed so a miss in memory
    /// can fall through to the stable PKFile without re-deriving the
    /// common/uncommon split outside this module.
    pub fn common_fp(&self, fps: &[Fingerprint]) -> Fingerprint {
        self.combine_over(&self.common_names, fps)
    }

    fn combine_over(&self, mask: &NameSet, fps: &[Fingerprint]) -> Fingerprint {
        let picked: Vec<Fingerprint> = mask.iter_ascending().map(|i| fps[i as usize]).collect();
        Fingerprint::combine(picked.iter())
    }

    /// §4.2 "NewEntry": resolve `names` against `all_names`/`name_index`,
    /// appending as needed, and build a `CacheEntry` plus its
    /// classification. Rolls back `all_names`/`name_index` appends on
    /// failure.
    pub fn new_entry(
        &mut self,
        names: &[String],
        fps: Vec<Fingerprint>,
        model: u64,
        value: Vec<u8>,
        kids: Vec<u32>,
    ) -> Result<PendingEntry> {
        if names.len() != fps.len() {
            return Err(CacheError::BadAddEntryArgs(
                "names and fps length mismatch".to_string(),
            ));
        }

        let appended_from = self.all_names.len();
        let mut imap = IntIntMap::new();
        let mut seen = std::collections::HashSet::new();
        let mut discovered_indices = Vec::with_capacity(names.len());

        let result = (|| -> Result<()> {
            for (pos, name) in names.iter().enumerate() {
                let idx = if let Some(&idx) = self.name_index.get(name) {
                    idx
                } else {
                    let idx = self.all_names.len() as u32;
                    if self.all_names.len() >= MAX_NAMES {
                        return Err(CacheError::TooManyNames(self.all_names.len() + 1));
                    }
                    self.all_names.push(name.clone());
                    self.name_index.insert(name.clone(), idx);
                    idx
                };
                if !seen.insert(idx) {
                    return Err(CacheError::DuplicateNames);
                }
                if idx as usize != pos {
                    imap.insert(idx, pos as u32);
                }
                discovered_indices.push(idx);
            }
            Ok(())
        })();

        if let Err(e) = result {
            self.all_names.truncate(appended_from);
            self.name_index.retain(|_, &mut idx| (idx as usize) < appended_from);
            return Err(e);
        }

        if self.all_names.len() > appended_from {
            self.names_epoch += 1;
        }

        let name_set = NameSet::from_indices(discovered_indices.iter().copied());
        let uncommon_names = name_set.difference(&self.common_names);
        let common = self.common_names.is_subset_of(&name_set);

        let imap = if imap.is_empty() { None } else { Some(imap) };
        let entry = CacheEntry::new(0, self.pk, model, value, kids, fps, imap, uncommon_names);
        let key = if common {
            entry.combine_fp(&self.common_names)
        } else {
            entry.combine_fp(&entry.uncommon_names)
        };

        Ok(PendingEntry { entry, common, key })
    }

    /// §4.2 "AddEntry": place a built entry, assigning its CI.
    pub fn add_entry(&mut self, mut pending: PendingEntry, ci: u32, source_func: Option<String>, bump_pk_epoch: bool) -> u32 {
        pending.entry.ci = ci;
        if self.source_func.is_none() {
            self.source_func = source_func;
        }
        self.is_stable_empty = false;
        if bump_pk_epoch {
            self.pk_epoch += 1;
        }
        if pending.common {
            self.new_common.entry(pending.key).or_default().push(pending.entry);
        } else {
            self.new_uncommon.push(pending.entry);
        }
        ci
    }

    pub fn has_new_entries(&self) -> bool {
        !self.new_uncommon.is_empty() || self.new_common.values().any(|v| !v.is_empty())
    }

    /// §4.2 "Checkpoint": snapshot what the next flush writes, then
    /// atomically bump `pk_epoch` so later insertions land in the next
    /// generation.
    pub fn checkpoint(&mut self) -> VpkChkpt {
        let has_new_entries = self.has_new_entries();
        let mut new_common_heads = HashMap::new();
        let mut flushed_entries = Vec::new();
        for (k, list) in &self.new_common {
            new_common_heads.insert(*k, list.len());
            flushed_entries.extend(list.iter().cloned());
        }
        let new_uncommon_head = self.new_uncommon.len();
        flushed_entries.extend(self.new_uncommon[..new_uncommon_head].iter().cloned());

        let chkpt = VpkChkpt {
            pk: self.pk,
            names_epoch: self.names_epoch,
            all_names_len: self.all_names.len(),
            pk_epoch: self.pk_epoch,
            new_common_heads,
            new_uncommon_head,
            flushed_entries,
            has_new_entries,
        };
        self.pk_epoch += 1;
        chkpt
    }

    /// §4.2 "Update (applied after stable rewrite)".
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        chkpt: &VpkChkpt,
        stable_after: &StablePKFile,
        ex_common: &NameSet,
        ex_uncommon: &NameSet,
        mask: &NameSet,
        remap: &[Option<u32>],
        keep_new_on_flush: bool,
        keep_old_on_flush: bool,
    ) {
        // Drop exactly the entries that were flushed: truncate each
        // new_common list and new_uncommon at the saved heads.
        for (k, head) in &chkpt.new_common_heads {
            if let Some(list) = self.new_common.get_mut(k) {
                if *head <= list.len() {
                    list.drain(0..*head);
                }
            }
        }
        self.new_common.retain(|_, v| !v.is_empty());
        if chkpt.new_uncommon_head <= self.new_uncommon.len() {
            self.new_uncommon.drain(0..chkpt.new_uncommon_head);
        }

        // Propagate the common-set change to everything still pending,
        // then reclassify entries that crossed the common/uncommon
        // line.
        let mut remaining: Vec<CacheEntry> = self.new_uncommon.drain(..).collect();
        for list in self.new_common.values_mut() {
            remaining.append(list);
        }
        self.new_common.clear();

        // Re-key every remaining entry under the new common_names. Per
        // the resolution in DESIGN.md (the fps.len/uncommon_names
        // cardinality note), this crate classifies every entry
        // uniformly rather than tracking the rare case of an entry
        // that never referenced some common name, so the post-update
        // entries all land back in new_common.
        let new_common_names = self.common_names.remap(remap);
        for mut e in remaining {
            e.update(ex_common, ex_uncommon, mask, remap);
            let key = e.combine_fp(&new_common_names);
            self.new_common.entry(key).or_default().push(e);
        }

        // Rebuild warm per the keep-new/keep-old flags, sourcing
        // entries from the freshly written stable state so every
        // mutation the rewrite applied is visible.
        let mut new_warm = HashMap::new();
        if keep_old_on_flush || keep_new_on_flush {
            for g in &stable_after.groups {
                new_warm.insert(g.common_fp, g.entries.clone());
            }
        }
        self.warm = new_warm;

        // Pack all_names/common_names/name_index by mask/remap.
        let old_len = self.all_names.len();
        let mut packed_names = vec![String::new(); mask.count()];
        for (old_idx, name) in self.all_names.iter().enumerate() {
            if let Some(Some(new_idx)) = remap.get(old_idx) {
                packed_names[*new_idx as usize] = name.clone();
            }
        }
        let names_changed = packed_names.len() != old_len
            || remap
                .iter()
                .take(old_len)
                .enumerate()
                .any(|(i, r)| *r != Some(i as u32));
        self.all_names = packed_names;
        self.name_index = self
            .all_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
        self.common_names = self.common_names.remap(remap);

        if names_changed {
            self.names_epoch += 1;
        }

        if stable_after.is_empty() && !self.has_new_entries() {
            self.is_stable_empty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(b: u8) -> Fingerprint {
        Fingerprint::of_bytes(&[b])
    }

    #[test]
    fn new_entry_assigns_sequential_indices_and_identity_imap() {
        let mut vpk = VolatilePKFile::new(Fingerprint::ZERO);
        let names = vec!["a".to_string(), "b".to_string()];
        let fps = vec![fp(1), fp(2)];
        let pending = vpk.new_entry(&names, fps, 0, vec![], vec![]).unwrap();
        assert!(pending.entry.imap.is_none());
        assert_eq!(vpk.all_names, vec!["a", "b"]);
    }

    #[test]
    fn new_entry_rejects_duplicates_and_rolls_back() {
        let mut vpk = VolatilePKFile::new(Fingerprint::ZERO);
        let names = vec!["a".to_string(), "a".to_string()];
        let fps = vec![fp(1), fp(2)];
        let before = vpk.all_names.len();
        let err = vpk.new_entry(&names, fps, 0, vec![], vec![]);
        assert!(matches!(err, Err(CacheError::DuplicateNames)));
        assert_eq!(vpk.all_names.len(), before);
    }

    #[test]
    fn lookup_finds_new_common_entry() {
        let mut vpk = VolatilePKFile::new(Fingerprint::ZERO);
        let names = vec!["a".to_string()];
        let fps = vec![fp(9)];
        let pending = vpk.new_entry(&names, fps.clone(), 0, b"v".to_vec(), vec![]).unwrap();
        assert!(pending.common); // common_names is empty, vacuously a subset
        vpk.add_entry(pending, 42, Some("f".to_string()), false);

        match vpk.lookup(vpk.names_epoch, &fps).unwrap() {
            LookupOutcome::Hit { ci, value, class } => {
                assert_eq!(ci, 42);
                assert_eq!(value, b"v");
                assert_eq!(class, LookupClass::New);
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn lookup_rejects_stale_epoch() {
        let vpk = VolatilePKFile::new(Fingerprint::ZERO);
        let err = vpk.lookup(5, &[]);
        assert!(matches!(err, Err(CacheError::BadLookupArgs(_))));
    }
}
