//! Component G: Volatile MultiPKFile -- the set of VPKFiles sharing a
//! PK prefix, plus the flush coordinator that serializes rewrites of
//! the single MultiPKFile they back onto (spec.md §3 "VMulti", §4.5
//! "VMultiPKFile"). Grounded on the teacher's lock-table pattern
//! (`transaction/locks.rs`'s `LockTableEntry`: a mutex-guarded map plus
//! an `Arc<Condvar>` that waiters block on) generalized from one
//! resource's grant set to "at most one rewrite in flight per MPK".

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::diagnostics;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::fp::Fingerprint;
use crate::multipkfile::codec::MultiPKFile;
use crate::multipkfile::path::{prune_empty_parents, write_atomic};
use crate::pkfile::stable::StablePKFile;
use crate::volatile::vpk::{VolatilePKFile, VpkChkpt};

#[derive(Default)]
struct FlushCoordinatorState {
    running: bool,
    num_new_entries: usize,
    auto_flush_pending: bool,
    last_touch_epoch: u64,
}

/// Outcome of `VMultiPKFile::commit_rewrite`, per §4.5 steps 3/7.
pub struct RewriteOutcome {
    /// True if the MultiPKFile ended up with zero PKFiles and was
    /// deleted (its parent directories pruned upward) rather than
    /// rewritten.
    pub mpk_became_empty: bool,
    /// `(pk, pk_epoch)` pairs for every PKFile that became empty during
    /// this rewrite. `PreparedRewrite` surfaces these to the caller so
    /// they can be appended to the empty-PK log before `commit_rewrite`
    /// is called (§4.9 step 5's ordering).
    pub empty_pk_records: Vec<(Fingerprint, u32)>,
}

/// The in-memory half of a rewrite, staged but not yet published to
/// disk. Splitting `rewrite` into `prepare_rewrite`/`commit_rewrite`
/// lets the caller write the empty-PK log records in between, matching
/// §4.9's "empty-PK log committed before the MultiPKFile rename" order
/// instead of publishing the rename first and logging after.
pub struct PreparedRewrite {
    mpk_path: PathBuf,
    stable_root: PathBuf,
    /// `Some(bytes)` to be written atomically to `mpk_path`; `None`
    /// means the MultiPKFile became empty and should be pruned instead.
    encoded: Option<Vec<u8>>,
    empty_pk_records: Vec<(Fingerprint, u32)>,
}

impl PreparedRewrite {
    pub fn empty_pk_records(&self) -> &[(Fingerprint, u32)] {
        &self.empty_pk_records
    }
}

/// Map `PK -> VPK` for every PK sharing a fixed prefix, with the
/// `running`/`waiting`/`num_new_entries`/`auto_flush_pending`/
/// `last_touch_epoch` flush-coordinator fields from spec.md §3.
pub struct VMultiPKFile {
    vpks: Mutex<HashMap<Fingerprint, Arc<Mutex<VolatilePKFile>>>>,
    coord: Mutex<FlushCoordinatorState>,
    write_cv: Condvar,
}

impl VMultiPKFile {
    pub fn new() -> Self {
        Self {
            vpks: Mutex::new(HashMap::new()),
            coord: Mutex::new(FlushCoordinatorState::default()),
            write_cv: Condvar::new(),
        }
    }

    pub fn vpk_count(&self) -> usize {
        self.vpks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vpks.lock().is_empty()
    }

    /// Whether a rewrite of this MPK is currently in flight, per the
    /// free/evict loop's evictability check (§4.12: "containing MPK
    /// not being rewritten").
    pub fn is_rewriting(&self) -> bool {
        self.coord.lock().running
    }

    /// Whether an async flush is already queued for this MPK.
    pub fn flush_pending(&self) -> bool {
        self.coord.lock().auto_flush_pending
    }

    /// `find_vpk`'s race-safety contract (§4.11): if the retrieved VPK
    /// is marked `evicted`, the free/evict loop has (or is about to
    /// have) removed it from this table; drop our reference and retry
    /// rather than returning a VPK that can no longer accept inserts.
    pub fn get_or_create(
        &self,
        pk: Fingerprint,
        loader: impl FnOnce() -> Option<StablePKFile>,
    ) -> Arc<Mutex<VolatilePKFile>> {
        loop {
            let existing = self.vpks.lock().get(&pk).cloned();
            if let Some(vpk) = existing {
                if !vpk.lock().evicted {
                    return vpk;
                }
                let mut map = self.vpks.lock();
                if let Some(cur) = map.get(&pk) {
                    if Arc::ptr_eq(cur, &vpk) {
                        map.remove(&pk);
                    }
                }
                continue;
            }
            let fresh = match loader() {
                Some(stable) => VolatilePKFile::from_stable(&stable),
                None => VolatilePKFile::new(pk),
            };
            let arc = Arc::new(Mutex::new(fresh));
            let mut map = self.vpks.lock();
            let slot = map.entry(pk).or_insert(arc);
            return slot.clone();
        }
    }

    pub fn get(&self, pk: &Fingerprint) -> Option<Arc<Mutex<VolatilePKFile>>> {
        self.vpks.lock().get(pk).cloned()
    }

    pub fn remove(&self, pk: &Fingerprint) -> Option<Arc<Mutex<VolatilePKFile>>> {
        self.vpks.lock().remove(pk)
    }

    pub fn pks(&self) -> Vec<Fingerprint> {
        self.vpks.lock().keys().copied().collect()
    }

    pub fn touch(&self, epoch: u64) {
        self.coord.lock().last_touch_epoch = epoch;
    }

    pub fn last_touch_epoch(&self) -> u64 {
        self.coord.lock().last_touch_epoch
    }

    /// Record one new entry landing somewhere under this VM; returns
    /// true the first time the running total crosses `threshold`
    /// (`[CacheServer]/MPKFileFlushNum`), so the caller knows to
    /// enqueue exactly one async flush (§4.11 `add_entry`).
    pub fn note_new_entry(&self, threshold: usize) -> bool {
        let mut c = self.coord.lock();
        c.num_new_entries += 1;
        if c.num_new_entries >= threshold && !c.auto_flush_pending {
            c.auto_flush_pending = true;
            true
        } else {
            false
        }
    }

    pub fn has_new_entries(&self) -> bool {
        self.vpks.lock().values().any(|v| v.lock().has_new_entries())
    }

    /// `lock_for_write`: block while a rewrite of this MPK is already
    /// running, then claim the slot. At most one rewrite per MPK
    /// proceeds at a time (§4.5); rewrites of *other* MPKs are
    /// unaffected (§5 "A rewrite of one MPK serializes only rewrites
    /// of the same MPK").
    pub fn lock_for_write(&self) {
        let mut c = self.coord.lock();
        while c.running {
            self.write_cv.wait(&mut c);
        }
        c.running = true;
    }

    pub fn release_write_lock(&self) {
        let mut c = self.coord.lock();
        c.running = false;
        c.auto_flush_pending = false;
        c.num_new_entries = 0;
        self.write_cv.notify_all();
    }

    /// `chkpt_for_rewrite(to_delete)`: checkpoint every VPK that has
    /// new entries; `needs_write` is false iff `to_delete` is absent
    /// and nothing was checkpointed.
    pub fn chkpt_for_rewrite(&self, to_delete: bool) -> (bool, HashMap<Fingerprint, VpkChkpt>) {
        let map = self.vpks.lock();
        let mut chkpts = HashMap::new();
        for (pk, vpk) in map.iter() {
            let mut g = vpk.lock();
            if g.has_new_entries() {
                chkpts.insert(*pk, g.checkpoint());
            }
        }
        let needs_write = to_delete || !chkpts.is_empty();
        (needs_write, chkpts)
    }

    /// `rewrite(...)`, per §4.5. The caller holds the write lock
    /// (`lock_for_write`) and is responsible for calling
    /// `release_write_lock` afterward regardless of outcome, and for
    /// appending `empty_pk_records` to the empty-PK log *before*
    /// committing this rewrite's rename (§4.9 step 5's ordering).
    ///
    /// Per DESIGN.md's resolution of the `MISTRUST_PKLEN` open
    /// question (spec.md §9), every PKFile touched by a checkpoint or
    /// a deletion is fully rehydrated and re-encoded; unaffected
    /// PKFiles are left byte-identical in the rewritten MultiPKFile.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_rewrite(
        &self,
        mpk_path: &Path,
        stable_root: &Path,
        chkpts: &HashMap<Fingerprint, VpkChkpt>,
        to_delete: Option<&HashSet<u32>>,
        keep_new_on_flush: bool,
        keep_old_on_flush: bool,
    ) -> Result<PreparedRewrite> {
        let mut mpk = if mpk_path.exists() {
            MultiPKFile::decode(&fs::read(mpk_path)?)?
        } else {
            MultiPKFile::new()
        };

        let map = self.vpks.lock();
        for (pk, vpk) in map.iter() {
            if vpk.lock().evicted && (chkpts.contains_key(pk) || to_delete.is_some()) {
                diagnostics::invariant_violation("VMultiPKFile::rewrite observed an evicted VPK", Some(*pk), None);
            }
        }

        let mut touched: Vec<Fingerprint> = mpk.pkfiles.iter().map(|p| p.pk).collect();
        for pk in chkpts.keys() {
            if !touched.contains(pk) {
                touched.push(*pk);
            }
        }

        let mut empty_pk_records = Vec::new();

        for pk in touched {
            let existing_idx = mpk.pkfiles.iter().position(|p| p.pk == pk);
            let chkpt = chkpts.get(&pk);
            if chkpt.is_none() && to_delete.is_none() {
                continue;
            }

            let mut stable = match existing_idx {
                Some(i) => mpk.pkfiles[i].clone(),
                None => StablePKFile::empty(pk),
            };

            let mut survivors: Vec<CacheEntry> = Vec::new();
            for g in &stable.groups {
                for e in &g.entries {
                    let deleted = to_delete.is_some_and(|d| d.contains(&e.ci));
                    if !deleted {
                        survivors.push(e.clone());
                    }
                }
            }
            if let Some(c) = chkpt {
                for e in &c.flushed_entries {
                    let deleted = to_delete.is_some_and(|d| d.contains(&e.ci));
                    if !deleted {
                        survivors.push(e.clone());
                    }
                }
            }

            let next_pk_epoch = chkpt.map(|c| c.pk_epoch + 1).unwrap_or(stable.pk_epoch + 1);
            let outcome = stable.update(survivors, next_pk_epoch);

            if outcome.became_empty {
                empty_pk_records.push((pk, stable.pk_epoch));
                if let Some(i) = existing_idx {
                    mpk.pkfiles.remove(i);
                }
            } else if let Some(i) = existing_idx {
                mpk.pkfiles[i] = stable.clone();
            } else {
                mpk.pkfiles.push(stable.clone());
            }

            if let Some(vpk_arc) = map.get(&pk) {
                let mut vpk = vpk_arc.lock();
                let synthetic;
                let effective_chkpt = match chkpt {
                    Some(c) => c,
                    None => {
                        synthetic = VpkChkpt {
                            pk,
                            names_epoch: vpk.names_epoch,
                            all_names_len: vpk.all_names.len(),
                            pk_epoch: vpk.pk_epoch,
                            new_common_heads: HashMap::new(),
                            new_uncommon_head: 0,
                            flushed_entries: Vec::new(),
                            has_new_entries: false,
                        };
                        &synthetic
                    }
                };
                vpk.update(
                    effective_chkpt,
                    &stable,
                    &outcome.ex_common,
                    &outcome.ex_uncommon,
                    &outcome.mask,
                    &outcome.remap,
                    keep_new_on_flush,
                    keep_old_on_flush,
                );
                if chkpt.is_none() {
                    // No checkpoint was flushed for this VPK (only a
                    // deletion touched it); its pk_epoch must not have
                    // advanced past what `update` already set.
                    vpk.pk_epoch = stable.pk_epoch;
                }
            }
        }
        drop(map);

        let encoded = if mpk.pkfiles.is_empty() { None } else { Some(mpk.encode()) };

        Ok(PreparedRewrite {
            mpk_path: mpk_path.to_path_buf(),
            stable_root: stable_root.to_path_buf(),
            encoded,
            empty_pk_records,
        })
    }

    /// Publish a `PreparedRewrite` to disk: write the new MultiPKFile
    /// atomically, or prune it away if it became empty. Call only after
    /// `prepared.empty_pk_records()` have been durably appended to the
    /// empty-PK log.
    pub fn commit_rewrite(&self, prepared: PreparedRewrite) -> Result<RewriteOutcome> {
        let mpk_became_empty = prepared.encoded.is_none();
        match &prepared.encoded {
            Some(bytes) => write_atomic(&prepared.mpk_path, bytes)?,
            None => prune_empty_parents(&prepared.mpk_path, &prepared.stable_root)?,
        }
        Ok(RewriteOutcome {
            mpk_became_empty,
            empty_pk_records: prepared.empty_pk_records,
        })
    }
}

impl Default for VMultiPKFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_reuses_existing_vpk() {
        let vm = VMultiPKFile::new();
        let pk = Fingerprint::of_bytes(b"pk");
        let a = vm.get_or_create(pk, || None);
        let b = vm.get_or_create(pk, || None);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn get_or_create_retries_past_evicted_entry() {
        let vm = VMultiPKFile::new();
        let pk = Fingerprint::of_bytes(b"pk");
        let first = vm.get_or_create(pk, || None);
        first.lock().evicted = true;
        let second = vm.get_or_create(pk, || None);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.lock().evicted);
    }

    #[test]
    fn note_new_entry_fires_once_per_threshold_crossing() {
        let vm = VMultiPKFile::new();
        assert!(!vm.note_new_entry(3));
        assert!(!vm.note_new_entry(3));
        assert!(vm.note_new_entry(3));
        assert!(!vm.note_new_entry(3));
    }

    #[test]
    fn lock_for_write_serializes() {
        let vm = Arc::new(VMultiPKFile::new());
        vm.lock_for_write();
        let vm2 = vm.clone();
        let handle = std::thread::spawn(move || {
            vm2.lock_for_write();
            vm2.release_write_lock();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        vm.release_write_lock();
        handle.join().unwrap();
    }
}
