//! The cache server coordinator (spec.md §4.11/§4.12): the public
//! operation surface wired to the lookup engine, the MultiPKFile
//! rewrite engine, the four logs, and the weeder, plus the background
//! workers that keep them all converging. Everything under this module
//! is driven from here; the RPC marshalling that exposes these
//! operations to evaluators lives outside the crate's scope (spec.md
//! §1) -- `src/main.rs` and `src/bin/ctl.rs` are the thin harnesses
//! that call straight into an `Arc<Coordinator>`.

pub mod leases;
pub mod stats;
pub mod weeder;
pub mod workers;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::bitset::NameSet;
use crate::config::CacheConfig;
use crate::coordinator::leases::LeaseTable;
use crate::coordinator::stats::{CacheState, Stats};
use crate::coordinator::weeder::Weeder;
use crate::coordinator::workers::{CheckpointRequest, CheckpointWorker, CleanWorker, FlushWorkerPool};
use crate::diagnostics;
use crate::error::{CacheError, Result};
use crate::fp::Fingerprint;
use crate::logs::cache_log::{CacheLog, CacheLogRecord};
use crate::logs::empty_pk_log::EmptyPkLog;
use crate::logs::graph_log::GraphLog;
use crate::logs::used_ci_log::{next_avail, UsedCiLog, UsedCiOp};
use crate::multipkfile::codec::MultiPKFile;
use crate::multipkfile::path::{mpk_path, prefix_of};
use crate::pkfile::stable::StablePKFile;
use crate::recovery;
use crate::volatile::vmulti::{RewriteOutcome, VMultiPKFile};
use crate::volatile::vpk::{LookupOutcome, VolatilePKFile};

/// Outcome of `Coordinator::lookup`.
#[derive(Debug)]
pub enum LookupResult {
    Hit { ci: u32, value: Vec<u8> },
    Miss,
    WrongInstance,
}

/// Outcome of `Coordinator::add_entry`.
#[derive(Debug)]
pub enum AddEntryOutcome {
    Added { ci: u32 },
    /// A kid CI was not currently leased. The CI allocated for this
    /// entry stays allocated and leased, but no graph-log node was
    /// written and nothing was placed in any VPK -- per §5's
    /// "cancellation" note, this orphan is collectible in the next weed
    /// cycle if the client never retries with a valid parent.
    NoLease,
    WrongInstance,
}

/// Identity tuple returned by `get_cache_id`.
#[derive(Debug, Clone, Copy)]
pub struct CacheId {
    pub instance_fp: Fingerprint,
}

/// The durable/in-memory state of the cache server, minus the RPC
/// transport. Always held behind `Arc` -- background workers keep a
/// `Weak` back-reference so they can be resolved away once the last
/// external handle drops.
pub struct Coordinator {
    pub config: CacheConfig,
    self_weak: Weak<Coordinator>,

    vms: DashMap<Fingerprint, Arc<VMultiPKFile>>,
    used_cis: Mutex<NameSet>,

    used_ci_log: UsedCiLog,
    graph_log: Arc<GraphLog>,
    cache_log: CacheLog,
    empty_pk_log: EmptyPkLog,

    leases: Arc<LeaseTable>,
    weeder: Arc<Weeder>,
    stats: Stats,

    instance_fp: Fingerprint,

    flush_pool: FlushWorkerPool,
    clean_worker: CleanWorker,
    checkpoint_worker: Arc<CheckpointWorker>,

    free_mpk_epoch: AtomicU64,
    /// `(pk -> names_epoch)` side table populated when a stable-empty
    /// VPK with a nonzero names-epoch is evicted, so a later
    /// `find_vpk` recreating it cannot regress the epoch (§4.12
    /// "Evictable").
    evicted_names_epoch: Mutex<HashMap<Fingerprint, u32>>,
}

impl Coordinator {
    /// Open every log and the stable-cache root, recover durable state,
    /// replay live cache-log records into fresh VPKs, and start the
    /// background workers (free/evict, deletion, checkpoint). Mirrors
    /// the startup sequence `original_source`'s `VCache.C` runs before
    /// accepting RPCs.
    pub fn open(config: CacheConfig) -> Result<Arc<Self>> {
        fs::create_dir_all(&config.stable_cache_root)?;
        fs::create_dir_all(&config.log_root)?;

        let used_ci_log = UsedCiLog::open(config.log_root.join("used_ci"))?;
        let graph_log = Arc::new(GraphLog::open(config.log_root.join("graph"))?);
        let cache_log = CacheLog::open(config.log_root.join("cache"))?;
        let empty_pk_log = EmptyPkLog::open(config.log_root.join("empty_pk"))?;
        let leases = Arc::new(LeaseTable::new(config.lease_ttl));
        let weeder = Arc::new(Weeder::open(
            config.stable_cache_root.join("meta"),
            graph_log.clone(),
            leases.clone(),
        )?);

        let stable_root = config.stable_cache_root.clone();
        let granularity = config.prefix_granularity;
        let arc_bits = config.arc_bits;
        let recovered = recovery::recover(&used_ci_log, &cache_log, &empty_pk_log, |pk| {
            stable_epoch_on_disk(&stable_root, granularity, arc_bits, pk)
        })?;

        let vms: DashMap<Fingerprint, Arc<VMultiPKFile>> = DashMap::new();
        let flush_worker_count = config.flush_worker_count;
        let coordinator = Arc::new_cyclic(|weak| {
            let instance_fp = Fingerprint::of_bytes(&rand::random::<[u8; 16]>());
            Self {
                config,
                self_weak: weak.clone(),
                vms,
                used_cis: Mutex::new(recovered.used_cis),
                used_ci_log,
                graph_log,
                cache_log,
                empty_pk_log,
                leases,
                weeder,
                stats: Stats::default(),
                instance_fp,
                flush_pool: FlushWorkerPool::new(flush_worker_count),
                clean_worker: CleanWorker::new(),
                checkpoint_worker: Arc::new(CheckpointWorker::new()),
                free_mpk_epoch: AtomicU64::new(0),
                evicted_names_epoch: Mutex::new(HashMap::new()),
            }
        });

        for rec in recovered.live_cache_entries {
            coordinator.replay_cache_log_record(rec)?;
        }

        coordinator.start_background_workers();
        Ok(coordinator)
    }

    fn replay_cache_log_record(&self, rec: CacheLogRecord) -> Result<()> {
        let vm = self.get_vm(rec.pk);
        let loader_pk = rec.pk;
        let vpk_arc = vm.get_or_create(loader_pk, || self.load_stable(loader_pk));
        let mut vpk = vpk_arc.lock();
        let pending = vpk.new_entry(&rec.names, rec.fps.clone(), rec.model, rec.value.clone(), rec.kids.clone())?;
        vpk.add_entry(pending, rec.ci, Some(rec.source_func.clone()).filter(|s| !s.is_empty()), false);
        if rec.pk_epoch > vpk.pk_epoch {
            vpk.pk_epoch = rec.pk_epoch;
        }
        Ok(())
    }

    fn start_background_workers(self: &Arc<Self>) {
        let weak = self.self_weak.clone();
        thread::spawn(move || run_free_evict_loop(weak));

        let weak = self.self_weak.clone();
        thread::spawn(move || run_deletion_worker(weak));

        let weak = self.self_weak.clone();
        thread::spawn(move || run_checkpoint_worker(weak));
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("coordinator outlives its own background workers")
    }

    fn stable_epoch(&self, pk: Fingerprint) -> Option<u32> {
        stable_epoch_on_disk(&self.config.stable_cache_root, self.config.prefix_granularity, self.config.arc_bits, pk)
    }

    fn load_stable(&self, pk: Fingerprint) -> Option<StablePKFile> {
        let path = self.mpk_path_for(pk);
        let bytes = fs::read(path).ok()?;
        let mpk = MultiPKFile::decode(&bytes).ok()?;
        mpk.find(&pk).cloned()
    }

    fn mpk_path_for(&self, pk: Fingerprint) -> std::path::PathBuf {
        let prefix = prefix_of(&pk, self.config.prefix_granularity);
        mpk_path(&self.config.stable_cache_root, &prefix, self.config.prefix_granularity, self.config.arc_bits)
    }

    fn get_vm_for_prefix(&self, prefix: Fingerprint) -> Arc<VMultiPKFile> {
        self.vms.entry(prefix).or_insert_with(|| Arc::new(VMultiPKFile::new())).clone()
    }

    fn get_vm(&self, pk: Fingerprint) -> Arc<VMultiPKFile> {
        self.get_vm_for_prefix(prefix_of(&pk, self.config.prefix_granularity))
    }

    fn check_instance(&self, instance_fp: Fingerprint) -> bool {
        instance_fp == self.instance_fp
    }

    /// `find_vpk(pk) -> (existed, vpk)`, §4.11. Touches both the owning
    /// VM's and this VPK's staleness clocks so the free/evict loop sees
    /// this access.
    pub fn find_vpk(&self, pk: Fingerprint) -> (bool, Arc<Mutex<VolatilePKFile>>) {
        let vm = self.get_vm(pk);
        let epoch = self.free_mpk_epoch.load(Ordering::Relaxed);
        vm.touch(epoch);
        let existed = vm.get(&pk).is_some();
        let vpk_arc = vm.get_or_create(pk, || self.load_stable(pk));
        {
            let mut vpk = vpk_arc.lock();
            vpk.free_epoch = epoch as i32;
            if !existed {
                if let Some(&saved) = self.evicted_names_epoch.lock().get(&pk) {
                    if vpk.names_epoch < saved {
                        vpk.names_epoch = saved;
                    }
                }
            }
        }
        (existed, vpk_arc)
    }

    /// §4.2 lookup plus the coordinator-level screening of §4.11.
    pub fn lookup(&self, instance_fp: Fingerprint, pk: Fingerprint, epoch: u32, fps: &[Fingerprint]) -> Result<LookupResult> {
        if !self.check_instance(instance_fp) {
            return Ok(LookupResult::WrongInstance);
        }

        let (_, vpk_arc) = self.find_vpk(pk);
        let outcome = {
            let vpk = vpk_arc.lock();
            vpk.lookup(epoch, fps)?
        };

        match outcome {
            LookupOutcome::Hit { ci, value, .. } => self.finish_hit(pk, ci, value),
            LookupOutcome::Miss => self.lookup_disk_fallback(pk, &vpk_arc, fps),
        }
    }

    /// §4.2 step 5/6: a miss against everything in memory falls
    /// through to the stable PKFile on disk, without holding
    /// `coordinator.mu` during the read (§5's suspension-points rule) --
    /// only the VPK's own mutex is taken, and only to compute the
    /// common fingerprint and to install a hit afterward.
    fn lookup_disk_fallback(
        &self,
        pk: Fingerprint,
        vpk_arc: &Arc<Mutex<VolatilePKFile>>,
        fps: &[Fingerprint],
    ) -> Result<LookupResult> {
        let common_fp = vpk_arc.lock().common_fp(fps);
        let Some(stable) = self.load_stable(pk) else {
            self.stats.record_miss();
            return Ok(LookupResult::Miss);
        };
        let Some(entry) = stable.find_entry(&common_fp, fps).cloned() else {
            self.stats.record_miss();
            return Ok(LookupResult::Miss);
        };
        vpk_arc.lock().install_disk_hit(common_fp, entry.clone());
        self.finish_hit(pk, entry.ci, entry.value)
    }

    fn finish_hit(&self, pk: Fingerprint, ci: u32, value: Vec<u8>) -> Result<LookupResult> {
        if self.config.no_hits {
            self.stats.record_miss();
            return Ok(LookupResult::Miss);
        }
        let hit_filter = self.weeder.hit_filter_snapshot();
        if hit_filter.test(ci) && !self.leases.is_leased(ci) {
            self.stats.record_miss();
            return Ok(LookupResult::Miss);
        }
        if !self.used_cis.lock().test(ci) {
            diagnostics::invariant_violation("lookup returned a hit for a CI absent from used_cis", Some(pk), Some(ci));
        }
        self.leases.acquire(ci);
        self.stats.record_hit();
        Ok(LookupResult::Hit { ci, value })
    }

    /// §4.11 `add_entry`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_entry(
        &self,
        instance_fp: Fingerprint,
        pk: Fingerprint,
        names: Vec<String>,
        fps: Vec<Fingerprint>,
        value: Vec<u8>,
        model: u64,
        kids: Vec<u32>,
        source_func: Option<String>,
    ) -> Result<AddEntryOutcome> {
        if !self.check_instance(instance_fp) {
            return Ok(AddEntryOutcome::WrongInstance);
        }
        if names.len() != fps.len() {
            return Err(CacheError::BadAddEntryArgs("names and fps length mismatch".into()));
        }

        let (_, vpk_arc) = self.find_vpk(pk);

        let ci = {
            let deleting = self.weeder.is_deleting();
            let hit_filter = if deleting { Some(self.weeder.hit_filter_snapshot()) } else { None };
            let mut used = self.used_cis.lock();
            let ci = next_avail(&used, hit_filter.as_ref())?;
            used.set(ci);
            ci
        };
        self.used_ci_log.append(UsedCiOp::Add, ci, ci)?;
        self.leases.acquire(ci);

        let all_kids_leased = kids.iter().all(|&k| self.leases.is_leased(k));
        if !all_kids_leased {
            return Ok(AddEntryOutcome::NoLease);
        }
        self.graph_log.append_node(ci, &kids)?;

        let pending = {
            let mut vpk = vpk_arc.lock();
            vpk.new_entry(&names, fps.clone(), model, value.clone(), kids.clone())?
        };
        let pk_epoch = vpk_arc.lock().pk_epoch;

        let rec = CacheLogRecord {
            source_func: source_func.clone().unwrap_or_default(),
            pk,
            pk_epoch,
            ci,
            value,
            model,
            kids,
            names,
            fps,
        };
        self.cache_log.append(&rec)?;

        {
            let mut vpk = vpk_arc.lock();
            vpk.add_entry(pending, ci, source_func, false);
        }

        let vm = self.get_vm(pk);
        if vm.note_new_entry(self.config.mpkfile_flush_threshold) {
            self.schedule_flush(pk);
        }

        Ok(AddEntryOutcome::Added { ci })
    }

    fn schedule_flush(&self, pk: Fingerprint) {
        let this = self.self_arc();
        self.flush_pool.submit(move || {
            if let Err(e) = this.flush_one(pk) {
                tracing::error!(error = %e, pk = %pk, "scheduled flush failed");
            }
        });
    }

    fn flush_one(&self, pk: Fingerprint) -> Result<()> {
        let prefix = prefix_of(&pk, self.config.prefix_granularity);
        self.flush_prefix(prefix, None).map(|_| ())
    }

    /// Rewrite the MultiPKFile for `prefix`, optionally deleting the CIs
    /// in `to_delete`. Caller must not already hold the VM's write
    /// lock. Commits the empty-PK log records *before* the rewrite's
    /// rename, per §4.9 step 5.
    fn flush_prefix(&self, prefix: Fingerprint, to_delete: Option<&HashSet<u32>>) -> Result<RewriteOutcome> {
        let vm = self.get_vm_for_prefix(prefix);
        vm.lock_for_write();
        let result = (|| -> Result<RewriteOutcome> {
            let (needs_write, chkpts) = vm.chkpt_for_rewrite(to_delete.is_some());
            if !needs_write {
                return Ok(RewriteOutcome {
                    mpk_became_empty: false,
                    empty_pk_records: Vec::new(),
                });
            }
            let path = mpk_path(&self.config.stable_cache_root, &prefix, self.config.prefix_granularity, self.config.arc_bits);
            let prepared = vm.prepare_rewrite(
                &path,
                &self.config.stable_cache_root,
                &chkpts,
                to_delete,
                self.config.keep_new_on_flush,
                self.config.keep_old_on_flush,
            )?;
            for &(pk, epoch) in prepared.empty_pk_records() {
                self.empty_pk_log.append(pk, epoch)?;
            }
            vm.commit_rewrite(prepared)
        })();
        vm.release_write_lock();
        let outcome = result?;
        if outcome.mpk_became_empty {
            self.vms.remove(&prefix);
        }
        Ok(outcome)
    }

    /// §4.11 `checkpoint`. Synchronous iff `done`: a `done` checkpoint
    /// is executed directly on the caller's thread, skipping the
    /// coalescing queue entirely, while async ones are handed to the
    /// dedicated checkpoint-worker thread. See DESIGN.md for why this
    /// departs slightly from a single literal FIFO.
    pub fn checkpoint(&self, instance_fp: Fingerprint, package_fp: Fingerprint, model: u64, cis: Vec<u32>, done: bool) -> Result<bool> {
        if !self.check_instance(instance_fp) {
            return Ok(false);
        }
        if done {
            self.execute_checkpoint(package_fp, model, &cis)?;
        } else {
            self.checkpoint_worker.enqueue(CheckpointRequest { package_fp, model, cis, done });
        }
        Ok(true)
    }

    fn execute_checkpoint(&self, package_fp: Fingerprint, model: u64, cis: &[u32]) -> Result<()> {
        for &ci in cis {
            if !self.leases.is_leased(ci) {
                diagnostics::invariant_violation("checkpoint root references an unleased CI", None, Some(ci));
            }
        }
        self.graph_log.append_root(cis)?;
        tracing::debug!(package_fp = %package_fp, model, roots = cis.len(), "checkpoint committed");
        Ok(())
    }

    /// §4.11 `flush_all`: flush every MPK, wait for flush workers to
    /// quiesce, then clean the cache-log.
    pub fn flush_all(&self) -> Result<()> {
        let this = self.self_arc();
        let prefixes: Vec<Fingerprint> = self.vms.iter().map(|e| *e.key()).collect();
        for prefix in prefixes {
            let this = this.clone();
            self.flush_pool.submit(move || {
                if let Err(e) = this.flush_prefix(prefix, None) {
                    tracing::error!(error = %e, prefix = %prefix, "flush_all: flush failed");
                }
            });
        }
        self.flush_pool.wait_quiescent();
        self.clean_cache_log();
        Ok(())
    }

    fn clean_cache_log(&self) {
        self.clean_worker.run(|| match self.cache_log.clean(&self.empty_pk_log, |pk| self.stable_epoch(pk)) {
            Ok(dropped) => tracing::debug!(dropped, "cache-log clean complete"),
            Err(e) => tracing::error!(error = %e, "cache-log clean failed"),
        });
    }

    pub fn get_cache_id(&self) -> CacheId {
        CacheId { instance_fp: self.instance_fp }
    }

    pub fn get_cache_instance(&self) -> Fingerprint {
        self.instance_fp
    }

    /// §4.11 `get_cache_state`: per-process telemetry plus the
    /// PKFile/entry counts a `VCacheStats` run would report.
    pub fn get_cache_state(&self) -> CacheState {
        let vm_count = self.vms.len();
        let mut vpk_count = 0usize;
        let mut total_entries = 0usize;
        for vm in self.vms.iter() {
            vpk_count += vm.vpk_count();
            for pk in vm.pks() {
                if let Some(vpk_arc) = vm.get(&pk) {
                    let v = vpk_arc.lock();
                    total_entries += v.new_uncommon.len();
                    total_entries += v.new_common.values().map(Vec::len).sum::<usize>();
                    total_entries += v.warm.values().map(Vec::len).sum::<usize>();
                }
            }
        }
        CacheState {
            host: self.config.host.clone(),
            port: self.config.port,
            instance_fp: self.instance_fp,
            version: crate::VERSION.to_string(),
            vm_count,
            vpk_count,
            total_entries,
            used_ci_count: self.used_cis.lock().count(),
            hit_count: self.stats.hits(),
            miss_count: self.stats.misses(),
            hit_filter_cardinality: self.weeder.hit_filter_snapshot().count(),
            deleting: self.weeder.is_deleting(),
        }
    }

    /// §4.11 `renew_leases`.
    pub fn renew_leases(&self, cis: &[u32]) -> bool {
        self.leases.renew(cis)
    }

    // -- Weeder RPC delegation (§4.10); marshalling itself is out of
    // scope (spec.md §1), these are the handlers an RPC layer calls.

    pub fn weeder_recovering(&self, conn: u64, done_marking: bool, is_alive: impl Fn(u64) -> bool) -> Result<()> {
        self.weeder.weeder_recovering(conn, done_marking, is_alive)
    }

    pub fn start_mark(&self) -> Result<(NameSet, u64)> {
        let snapshot = self.used_cis.lock().clone();
        self.weeder.start_mark(&snapshot)
    }

    pub fn set_hit_filter(&self, bv: NameSet) -> Result<()> {
        self.weeder.set_hit_filter(bv)
    }

    pub fn get_leases(&self) -> NameSet {
        self.weeder.get_leases()
    }

    pub fn resume_lease_exp(&self) {
        self.weeder.resume_lease_exp()
    }

    pub fn end_mark(&self, cis: NameSet, prefixes: Vec<Fingerprint>) -> Result<u64> {
        self.weeder.end_mark(cis, prefixes)
    }

    pub fn commit_chkpt(&self, supplied: &Path) -> Result<bool> {
        self.weeder.commit_chkpt(supplied)
    }
}

fn stable_epoch_on_disk(stable_root: &Path, granularity: u8, arc_bits: u8, pk: Fingerprint) -> Option<u32> {
    let prefix = prefix_of(&pk, granularity);
    let path = mpk_path(stable_root, &prefix, granularity, arc_bits);
    let bytes = fs::read(path).ok()?;
    let mpk = MultiPKFile::decode(&bytes).ok()?;
    mpk.find(&pk).map(|p| p.pk_epoch)
}

/// §4.12 "Free/evict loop".
fn run_free_evict_loop(weak: Weak<Coordinator>) {
    loop {
        let Some(this) = weak.upgrade() else { return };
        let pause = this.config.free_pause;
        drop(this);
        thread::sleep(pause);
        let Some(this) = weak.upgrade() else { return };

        let epoch = this.free_mpk_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot: Vec<(Fingerprint, Arc<VMultiPKFile>)> = this.vms.iter().map(|e| (*e.key(), e.value().clone())).collect();

        for (prefix, vm) in snapshot {
            let last_touch = vm.last_touch_epoch();
            let stale = i64::try_from(last_touch).unwrap_or(i64::MAX) <= epoch as i64 - this.config.flush_new_period as i64;
            if stale {
                let this2 = this.clone();
                this.flush_pool.submit(move || {
                    if let Err(e) = this2.flush_prefix(prefix, None) {
                        tracing::error!(error = %e, prefix = %prefix, "free/evict: stale-VM flush failed");
                    }
                });
                continue;
            }

            for pk in vm.pks() {
                let Some(vpk_arc) = vm.get(&pk) else { continue };
                let (has_new, has_warm, untouched) = {
                    let v = vpk_arc.lock();
                    (v.has_new_entries(), !v.warm.is_empty(), epoch as i64 - v.free_epoch as i64)
                };

                if !has_new && has_warm && untouched >= this.config.purge_warm_period as i64 {
                    vpk_arc.lock().warm.clear();
                }

                let has_warm_now = !vpk_arc.lock().warm.is_empty();
                let evictable = !has_new
                    && !has_warm_now
                    && untouched >= this.config.evict_period as i64
                    && !vm.is_rewriting()
                    && !vm.flush_pending();
                if evictable {
                    let (stable_empty, names_epoch) = {
                        let mut v = vpk_arc.lock();
                        v.evicted = true;
                        (v.is_stable_empty, v.names_epoch)
                    };
                    vm.remove(&pk);
                    if stable_empty && names_epoch > 0 {
                        this.evicted_names_epoch.lock().insert(pk, names_epoch);
                    }
                }
            }
        }
    }
}

/// §4.10 "Deletion worker" (always running): waits for a pending
/// deletion batch, weeds every remaining prefix, checkpoints
/// `used_cis`, then signals completion and triggers a cache-log clean.
fn run_deletion_worker(weak: Weak<Coordinator>) {
    loop {
        let Some(this) = weak.upgrade() else { return };
        let (hit_filter, remaining) = this.weeder.wait_for_deletion_batch();
        let to_delete: HashSet<u32> = hit_filter.iter_ascending().collect();

        for prefix in remaining {
            if let Err(e) = this.flush_prefix(prefix, Some(&to_delete)) {
                tracing::error!(error = %e, prefix = %prefix, "weeder: prefix rewrite failed");
            }
            let pause = this.config.weed_pause;
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }

        {
            let mut used = this.used_cis.lock();
            match this.used_ci_log.checkpoint(&used, &hit_filter) {
                Ok(after) => *used = after,
                Err(e) => tracing::error!(error = %e, "weeder: used_ci checkpoint failed"),
            }
        }

        if let Err(e) = this.weeder.finish_deletion() {
            tracing::error!(error = %e, "weeder: finish_deletion failed");
        }
        this.clean_cache_log();
    }
}

/// Drains the checkpoint worker's queue. `done` checkpoints are
/// executed synchronously on the requesting thread (see
/// `Coordinator::checkpoint`) and never reach this queue; this loop
/// only ever sees async ones, already coalesced by `enqueue`.
fn run_checkpoint_worker(weak: Weak<Coordinator>) {
    loop {
        let Some(this) = weak.upgrade() else { return };
        let worker = this.checkpoint_worker.clone();
        drop(this);
        let req = worker.dequeue();
        let Some(this) = weak.upgrade() else { return };
        if let Err(e) = this.execute_checkpoint(req.package_fp, req.model, &req.cis) {
            tracing::error!(error = %e, "async checkpoint failed");
        }
    }
}
