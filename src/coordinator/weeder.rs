//! Weeder mark/delete state machine (spec.md §4.10). The weeder is an
//! external client (garbage collector); this module holds the
//! durable/in-memory state its RPCs mutate and the deletion worker
//! that drains it, but not the RPC marshalling itself (out of scope
//! per §1).

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::bitset::NameSet;
use crate::coordinator::leases::LeaseTable;
use crate::error::{CacheError, Result};
use crate::fp::Fingerprint;
use crate::logs::graph_log::GraphLog;
use crate::logs::scalars;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeederState {
    Idle,
    Marking,
    Filtered,
    Deleting,
}

struct WeederInner {
    registered_conn: Option<u64>,
    marking: bool,
    deleting: bool,
    hit_filter: NameSet,
    mpks_to_weed: Vec<Fingerprint>,
    next_mpk_to_weed: usize,
    weeded_count: usize,
}

/// State behind the mark/delete RPCs of §4.10, plus the table of
/// scalar files (`deleting`, `hit_filter`) the weeder's durable state
/// lives in, per §6 "Stable scalars".
pub struct Weeder {
    root: PathBuf,
    graph_log: Arc<GraphLog>,
    leases: Arc<LeaseTable>,
    inner: Mutex<WeederInner>,
    not_deleting: Condvar,
    deleting_cv: Condvar,
}

impl Weeder {
    pub fn open(root: PathBuf, graph_log: Arc<GraphLog>, leases: Arc<LeaseTable>) -> Result<Self> {
        let deleting = scalars::read_deleting(&root)?;
        let hit_filter = scalars::read_hit_filter(&root)?;
        Ok(Self {
            root,
            graph_log,
            leases,
            inner: Mutex::new(WeederInner {
                registered_conn: None,
                marking: false,
                deleting,
                hit_filter,
                mpks_to_weed: Vec::new(),
                next_mpk_to_weed: 0,
                weeded_count: 0,
            }),
            not_deleting: Condvar::new(),
            deleting_cv: Condvar::new(),
        })
    }

    pub fn state(&self) -> WeederState {
        let i = self.inner.lock();
        if i.deleting {
            WeederState::Deleting
        } else if !i.hit_filter.is_empty() {
            WeederState::Filtered
        } else if i.marking {
            WeederState::Marking
        } else {
            WeederState::Idle
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.inner.lock().deleting
    }

    /// Snapshot of the hit-filter for lookup screening (§4.11
    /// `lookup`: "Miss if in filter and not leased").
    pub fn hit_filter_snapshot(&self) -> NameSet {
        self.inner.lock().hit_filter.clone()
    }

    /// `weeder_recovering(conn, done_marking)`. `is_alive` is supplied
    /// by the (out-of-scope) RPC layer as the liveness probe of §5 "A
    /// lost weeder client is detected via liveness check of its
    /// connection handle."
    pub fn weeder_recovering(
        &self,
        conn: u64,
        done_marking: bool,
        is_alive: impl Fn(u64) -> bool,
    ) -> Result<()> {
        let mut i = self.inner.lock();
        if let Some(existing) = i.registered_conn {
            if existing != conn && is_alive(existing) {
                return Err(CacheError::WeederInProgress);
            }
        }
        i.registered_conn = Some(conn);
        drop(i);
        self.leases.unfreeze();
        let mut i = self.inner.lock();
        if !done_marking && !i.hit_filter.is_empty() && !i.deleting {
            i.hit_filter = NameSet::new();
            scalars::write_hit_filter(&self.root, &i.hit_filter)?;
        }
        Ok(())
    }

    /// `start_mark`: wait while a deletion is in progress, then freeze
    /// lease expiration and start a fresh graph-log checkpoint.
    /// **Idle/Filtered -> Marking.**
    pub fn start_mark(&self, used_cis: &NameSet) -> Result<(NameSet, u64)> {
        let mut i = self.inner.lock();
        while i.deleting {
            self.not_deleting.wait(&mut i);
        }
        self.leases.freeze();
        let version = self.graph_log.begin_checkpoint()?;
        i.marking = true;
        Ok((used_cis.clone(), version))
    }

    /// `set_hit_filter(bv)`. **Marking -> Filtered.**
    pub fn set_hit_filter(&self, bv: NameSet) -> Result<()> {
        let mut i = self.inner.lock();
        if i.deleting {
            return Err(CacheError::DeletingInProgress(
                "cannot set hit-filter while a deletion is in progress".into(),
            ));
        }
        i.hit_filter = bv;
        i.marking = false;
        scalars::write_hit_filter(&self.root, &i.hit_filter)?;
        Ok(())
    }

    pub fn get_leases(&self) -> NameSet {
        self.leases.snapshot()
    }

    pub fn resume_lease_exp(&self) {
        self.leases.unfreeze();
    }

    /// `end_mark(cis, prefixes)`. **Filtered -> Deleting** (a no-op if
    /// already deleting, since re-entering would race the in-flight
    /// deletion worker).
    pub fn end_mark(&self, cis: NameSet, prefixes: Vec<Fingerprint>) -> Result<u64> {
        if cis.is_empty() {
            return Err(CacheError::BadCheckpoint("end_mark requires a non-empty CI set".into()));
        }
        let mut i = self.inner.lock();
        if !i.hit_filter.is_empty() && !cis.is_subset_of(&i.hit_filter) {
            return Err(CacheError::BadCheckpoint(
                "end_mark CIs must be a subset of the current hit-filter".into(),
            ));
        }
        if !i.hit_filter.is_empty() && !i.deleting {
            i.hit_filter = cis;
            i.mpks_to_weed = prefixes;
            i.next_mpk_to_weed = 0;
            i.weeded_count = 0;
            i.deleting = true;
            scalars::write_hit_filter(&self.root, &i.hit_filter)?;
            scalars::write_deleting(&self.root, true)?;
            self.deleting_cv.notify_all();
        }
        Ok(self.graph_log.pending_checkpoint_version().unwrap_or(0))
    }

    /// `commit_chkpt(name)`.
    pub fn commit_chkpt(&self, supplied: &std::path::Path) -> Result<bool> {
        self.graph_log.commit_chkpt(supplied)
    }

    /// Block until a deletion batch is pending, then return the
    /// hit-filter and the remaining prefixes to weed so the deletion
    /// worker (coordinator::workers / coordinator::mod) can process
    /// them.
    pub fn wait_for_deletion_batch(&self) -> (NameSet, Vec<Fingerprint>) {
        let mut i = self.inner.lock();
        while !i.deleting {
            self.deleting_cv.wait(&mut i);
        }
        let remaining = i.mpks_to_weed[i.next_mpk_to_weed..].to_vec();
        (i.hit_filter.clone(), remaining)
    }

    /// Called by the deletion worker once every prefix has been
    /// rewritten and `used_cis` has been checkpointed: clears
    /// `hit_filter`, flips `deleting` off, and wakes `start_mark`
    /// waiters.
    pub fn finish_deletion(&self) -> Result<()> {
        let mut i = self.inner.lock();
        i.hit_filter = NameSet::new();
        i.deleting = false;
        i.next_mpk_to_weed = i.mpks_to_weed.len();
        scalars::write_hit_filter(&self.root, &i.hit_filter)?;
        scalars::write_deleting(&self.root, false)?;
        self.not_deleting.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_weeder() -> (tempfile::TempDir, Weeder) {
        let tmp = tempfile::tempdir().unwrap();
        let graph_log = Arc::new(GraphLog::open(tmp.path().join("graph")).unwrap());
        let leases = Arc::new(LeaseTable::new(std::time::Duration::from_secs(60)));
        let weeder = Weeder::open(tmp.path().join("meta"), graph_log, leases).unwrap();
        (tmp, weeder)
    }

    #[test]
    fn full_mark_filter_delete_cycle() {
        let (_tmp, w) = fresh_weeder();
        assert_eq!(w.state(), WeederState::Idle);

        let used = NameSet::from_indices([1, 2, 3]);
        let (snap, _version) = w.start_mark(&used).unwrap();
        assert_eq!(snap, used);
        assert_eq!(w.state(), WeederState::Marking);

        w.set_hit_filter(NameSet::from_indices([2])).unwrap();
        assert_eq!(w.state(), WeederState::Filtered);

        let version = w.end_mark(NameSet::from_indices([2]), vec![Fingerprint::of_bytes(b"p")]).unwrap();
        assert_eq!(w.state(), WeederState::Deleting);
        let _ = version;

        let (hit_filter, prefixes) = w.wait_for_deletion_batch();
        assert_eq!(hit_filter, NameSet::from_indices([2]));
        assert_eq!(prefixes.len(), 1);

        w.finish_deletion().unwrap();
        assert_eq!(w.state(), WeederState::Idle);
    }

    #[test]
    fn end_mark_rejects_empty_cis() {
        let (_tmp, w) = fresh_weeder();
        let err = w.end_mark(NameSet::new(), vec![]);
        assert!(matches!(err, Err(CacheError::BadCheckpoint(_))));
    }

    #[test]
    fn weeder_recovering_rejects_concurrent_live_weeder() {
        let (_tmp, w) = fresh_weeder();
        w.weeder_recovering(1, true, |_| true).unwrap();
        let err = w.weeder_recovering(2, true, |_| true);
        assert!(matches!(err, Err(CacheError::WeederInProgress)));
        // A dead incumbent is replaced without complaint.
        w.weeder_recovering(2, true, |_| false).unwrap();
    }

    #[test]
    fn weeder_recovering_reverts_filtered_to_idle_unless_done_marking() {
        let (_tmp, w) = fresh_weeder();
        w.start_mark(&NameSet::new()).unwrap();
        w.set_hit_filter(NameSet::from_indices([1])).unwrap();
        assert_eq!(w.state(), WeederState::Filtered);
        w.weeder_recovering(1, false, |_| true).unwrap();
        assert_eq!(w.state(), WeederState::Idle);
    }
}
