//! `CacheEntry` (component C): one memoized result, per spec.md §3 and
//! §4.1. Fields are set at insertion and read-only thereafter except
//! for the uncommon-name set, which a PKFile rewrite can shrink/rebind
//! as names are packed or promoted to common.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bitset::NameSet;
use crate::fp::Fingerprint;
use crate::intintmap::IntIntMap;

/// XOR pre-check plus lazily-computed ordered combine, per §3.
#[derive(Debug, Default)]
pub struct UncommonTag {
    pub xor_word: u64,
    fp: Mutex<Option<Fingerprint>>,
}

impl Clone for UncommonTag {
    fn clone(&self) -> Self {
        Self {
            xor_word: self.xor_word,
            fp: Mutex::new(*self.fp.lock()),
        }
    }
}

impl UncommonTag {
    pub fn new(xor_word: u64) -> Self {
        Self {
            xor_word,
            fp: Mutex::new(None),
        }
    }

    pub fn with_fp(xor_word: u64, fp: Fingerprint) -> Self {
        Self {
            xor_word,
            fp: Mutex::new(Some(fp)),
        }
    }

    pub fn cached_fp(&self) -> Option<Fingerprint> {
        *self.fp.lock()
    }

    pub fn invalidate(&self) {
        *self.fp.lock() = None;
    }

    fn set(&self, fp: Fingerprint) {
        *self.fp.lock() = Some(fp);
    }
}

/// One memoized result for a given PK.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub ci: u32,
    pub pk: Fingerprint,
    pub model: u64,
    pub value: Vec<u8>,
    pub kids: Vec<u32>,
    /// Per-free-variable fingerprints, in insertion order.
    pub fps: Vec<Fingerprint>,
    /// Owning-PKFile `allNames` index -> index into `fps`. Absent means
    /// identity (the requester's order already matched `allNames`
    /// order for every referenced name).
    pub imap: Option<IntIntMap>,
    pub uncommon_names: NameSet,
    pub uncommon_tag: UncommonTag,
}

impl CacheEntry {
    /// Build a fresh entry at insertion time. `uncommon_names` is the
    /// caller-computed set of referenced names minus the PKFile's
    /// `common_names`.
    pub fn new(
        ci: u32,
        pk: Fingerprint,
        model: u64,
        value: Vec<u8>,
        kids: Vec<u32>,
        fps: Vec<Fingerprint>,
        imap: Option<IntIntMap>,
        uncommon_names: NameSet,
    ) -> Self {
        let xor_word = Self::compute_xor_word(&fps, &imap, &uncommon_names);
        Self {
            ci,
            pk,
            model,
            value,
            kids,
            fps,
            imap,
            uncommon_names,
            uncommon_tag: UncommonTag::new(xor_word),
        }
    }

    /// Reconstruct an entry decoded from a stable PKFile, with a
    /// pre-computed tag (disk format always persists the xor word, and
    /// may persist the combined fp too -- see `pkfile::stable`).
    pub fn from_decoded(
        ci: u32,
        pk: Fingerprint,
        model: u64,
        value: Vec<u8>,
        kids: Vec<u32>,
        fps: Vec<Fingerprint>,
        imap: Option<IntIntMap>,
        uncommon_names: NameSet,
        xor_word: u64,
        cached_fp: Option<Fingerprint>,
    ) -> Self {
        let uncommon_tag = match cached_fp {
            Some(fp) => UncommonTag::with_fp(xor_word, fp),
            None => UncommonTag::new(xor_word),
        };
        Self {
            ci,
            pk,
            model,
            value,
            kids,
            fps,
            imap,
            uncommon_names,
            uncommon_tag,
        }
    }

    /// Resolve an `allNames` index through `imap` to an index into
    /// `fps` (identity when `imap` is absent).
    fn fps_index(&self, name_idx: u32) -> u32 {
        match &self.imap {
            Some(m) => m.get(name_idx).unwrap_or(name_idx),
            None => name_idx,
        }
    }

    fn fp_for(&self, name_idx: u32) -> &Fingerprint {
        &self.fps[self.fps_index(name_idx) as usize]
    }

    /// `combine_fp(mask)`: `combine(fps[imap(i)] : i in mask ascending)`.
    pub fn combine_fp(&self, mask: &NameSet) -> Fingerprint {
        let resolved: Vec<Fingerprint> =
            mask.iter_ascending().map(|i| *self.fp_for(i)).collect();
        Fingerprint::combine(resolved.iter())
    }

    fn compute_xor_word(
        fps: &[Fingerprint],
        imap: &Option<IntIntMap>,
        uncommon_names: &NameSet,
    ) -> u64 {
        let mut acc = 0u64;
        for i in uncommon_names.iter_ascending() {
            let idx = match imap {
                Some(m) => m.get(i).unwrap_or(i),
                None => i,
            };
            acc ^= fps[idx as usize].low();
        }
        acc
    }

    fn recompute_xor_word(&self) -> u64 {
        Self::compute_xor_word(&self.fps, &self.imap, &self.uncommon_names)
    }

    /// `match(request_fps)`: cheap xor pre-check, then (only on
    /// agreement) the ordered combine. A false positive on the xor
    /// check is never a safety failure -- it costs one combine.
    pub fn matches(&self, request_fps: &[Fingerprint]) -> bool {
        let request_xor = self
            .uncommon_names
            .iter_ascending()
            .fold(0u64, |acc, i| acc ^ request_fps[i as usize].low());
        if request_xor != self.uncommon_tag.xor_word {
            return false;
        }
        let mine = self.combine_fp(&self.uncommon_names);
        if let Some(cached) = self.uncommon_tag.cached_fp() {
            return cached == Fingerprint::combine(
                self.uncommon_names
                    .iter_ascending()
                    .map(|i| &request_fps[i as usize]),
            ) && cached == mine;
        }
        self.uncommon_tag.set(mine);
        mine == Fingerprint::combine(
            self.uncommon_names
                .iter_ascending()
                .map(|i| &request_fps[i as usize]),
        )
    }

    /// Force the ordered combine to be computed and cached, so it gets
    /// persisted rather than recomputed on every future load. Called
    /// during a stable rewrite (§4.3 step 4, "uncommon-tags are
    /// unlazied to force persistence").
    pub fn unlazy_tag(&self) {
        let fp = self.combine_fp(&self.uncommon_names);
        self.uncommon_tag.set(fp);
    }

    /// `cycle_names(del_bitset, del_map)`: called when a rewrite
    /// appends previously-deleted names at higher indices. Rebind
    /// `uncommon_names` and `imap` per `del_map`. The xor word is
    /// unchanged (same fingerprints, same set, just renamed indices);
    /// any cached ordered fp is invalidated because ascending order
    /// over the renamed indices can differ.
    pub fn cycle_names(&mut self, del_map: &[(u32, u32)]) {
        if del_map.is_empty() {
            return;
        }
        let table: std::collections::HashMap<u32, u32> = del_map.iter().copied().collect();
        let mut new_uncommon = NameSet::new();
        for i in self.uncommon_names.iter_ascending() {
            new_uncommon.set(*table.get(&i).unwrap_or(&i));
        }
        if let Some(imap) = &self.imap {
            let mut new_imap = IntIntMap::new();
            for (k, v) in imap.iter() {
                new_imap.insert(*table.get(&k).unwrap_or(&k), v);
            }
            self.imap = Some(new_imap);
        }
        self.uncommon_names = new_uncommon;
        self.uncommon_tag.invalidate();
    }

    /// `pack(mask, remap)`: after a rewrite drops names from
    /// `all_names`, shrink `uncommon_names` to bits still in `mask`
    /// (reindexed via `remap`), rewrite `imap` keys, and drop `imap`
    /// entirely if the result is the identity map.
    pub fn pack(&mut self, mask: &NameSet, remap: &[Option<u32>]) {
        self.uncommon_names = self.uncommon_names.intersection(mask).remap(remap);
        if let Some(old_imap) = self.imap.take() {
            let mut new_imap = IntIntMap::new();
            for (k, v) in old_imap.iter() {
                if let Some(Some(new_k)) = remap.get(k as usize) {
                    new_imap.insert(*new_k, v);
                }
            }
            if !new_imap.is_identity_over(self.uncommon_names.iter_ascending()) {
                self.imap = Some(new_imap);
            }
        }
    }

    /// `update(ex_common, ex_uncommon, mask, remap)`: adjust this entry
    /// to a new owning-PK common-names set. `ex_common` is the set of
    /// names that were common and are now uncommon for this entry (get
    /// added to `uncommon_names`); `ex_uncommon` is the reverse (get
    /// removed). Rebuilds the tag, then packs.
    pub fn update(
        &mut self,
        ex_common: &NameSet,
        ex_uncommon: &NameSet,
        mask: &NameSet,
        remap: &[Option<u32>],
    ) {
        self.uncommon_names = self.uncommon_names.union(ex_common).difference(ex_uncommon);
        self.uncommon_tag.xor_word = self.recompute_xor_word();
        self.uncommon_tag.invalidate();
        self.pack(mask, remap);
    }

    /// Consistency check from §4.1: every `imap` key must be a member
    /// of `uncommon_names ∪ common_names`. Returns `false` on
    /// violation; callers at the coordinator boundary convert that into
    /// a panic via `diagnostics::invariant_violation`, per DESIGN
    /// NOTES §9.
    pub fn check_imap_domain(&self, common_names: &NameSet) -> bool {
        match &self.imap {
            None => true,
            Some(imap) => imap
                .keys()
                .all(|k| self.uncommon_names.test(k) || common_names.test(k)),
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
    fn matches_identical_fps() {
        let fps = vec![fp(1), fp(2)];
        let uncommon = NameSet::from_indices([0, 1]);
        let e = CacheEntry::new(0, Fingerprint::ZERO, 0, vec![], vec![], fps.clone(), None, uncommon);
        assert!(e.matches(&fps));
    }

    #[test]
    fn matches_rejects_different_fps() {
        let fps = vec![fp(1), fp(2)];
        let uncommon = NameSet::from_indices([0, 1]);
        let e = CacheEntry::new(0, Fingerprint::ZERO, 0, vec![], vec![], fps, None, uncommon);
        assert!(!e.matches(&[fp(1), fp(9)]));
    }

    #[test]
    fn combine_fp_respects_imap() {
        // Requester order: [b, a]. allNames order: [a, b]. imap maps
        // allNames idx -> fps idx: 0 (a) -> 1, 1 (b) -> 0.
        let fps = vec![fp(b'b'), fp(b'a')];
        let mut imap = IntIntMap::new();
        imap.insert(0, 1);
        imap.insert(1, 0);
        let common = NameSet::from_indices([0, 1]);
        let e = CacheEntry::new(0, Fingerprint::ZERO, 0, vec![], vec![], fps, Some(imap), NameSet::new());
        let combined = e.combine_fp(&common);
        let expected = Fingerprint::combine([&fp(b'a'), &fp(b'b')]);
        assert_eq!(combined, expected);
    }

    #[test]
    fn pack_drops_identity_imap() {
        let fps = vec![fp(1), fp(2)];
        let mut imap = IntIntMap::new();
        imap.insert(0, 0);
        imap.insert(1, 1);
        let uncommon = NameSet::from_indices([0, 1]);
        let mut e = CacheEntry::new(0, Fingerprint::ZERO, 0, vec![], vec![], fps, Some(imap), uncommon);
        let mask = NameSet::from_indices([0, 1]);
        let remap = vec![Some(0), Some(1)];
        e.pack(&mask, &remap);
        assert!(e.imap.is_none());
    }

    #[test]
    fn check_imap_domain_detects_violation() {
        let fps = vec![fp(1), fp(2), fp(3)];
        let mut imap = IntIntMap::new();
        imap.insert(5, 0); // 5 is outside uncommon ∪ common
        let uncommon = NameSet::from_indices([0, 1]);
        let e = CacheEntry::new(0, Fingerprint::ZERO, 0, vec![], vec![], fps, Some(imap), uncommon);
        let common = NameSet::from_indices([2]);
        assert!(!e.check_imap_domain(&common));
    }
}
