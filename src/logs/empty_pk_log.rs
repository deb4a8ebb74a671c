//! Empty-PK log (spec.md §4.9/§6): records each PK whose survivor set
//! just went empty, tagged with the `pk_epoch` at which that became
//! true, so `cache_log::clean` can tell a stale cache-log record (one
//! whose PK is now known to be empty as of a later epoch) from one
//! that is still live. "A checkpoint records: ... nothing (empty-PK
//! log, always empty checkpoint)": the checkpoint file for this log
//! never carries a body, it just marks the point up to which
//! `current` is authoritative.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::Result;
use crate::fp::Fingerprint;
use crate::logs::segment::SegmentLog;

pub struct EmptyPkLog {
    log: SegmentLog,
    current: Mutex<HashMap<Fingerprint, u32>>,
    /// Snapshot of `current` taken by `checkpoint_begin`, consulted by
    /// `get_epoch` until `checkpoint_end` discards it. Needed because
    /// between begin and end, new `append`s land in a fresh `current`
    /// while older lookups must still see what was true before.
    old: Mutex<Option<HashMap<Fingerprint, u32>>>,
}

impl EmptyPkLog {
    pub fn open(root: PathBuf) -> Result<Self> {
        let log = SegmentLog::open(root)?;
        let mut current = HashMap::new();
        for rec in log.read_all_segments()? {
            if let Some((pk, epoch)) = decode_record(&rec) {
                let slot = current.entry(pk).or_insert(epoch);
                if epoch > *slot {
                    *slot = epoch;
                }
            }
        }
        Ok(Self {
            log,
            current: Mutex::new(current),
            old: Mutex::new(None),
        })
    }

    /// The newest epoch at which `pk`'s survivor set is known to have
    /// been empty, across both the live table and any in-flight
    /// checkpoint snapshot.
    pub fn get_epoch(&self, pk: Fingerprint) -> Option<u32> {
        let cur = self.current.lock().get(&pk).copied();
        let old = self.old.lock().as_ref().and_then(|m| m.get(&pk).copied());
        match (cur, old) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Record that `pk` became empty as of `epoch`. A no-op if a
    /// strictly newer (or equal) epoch is already on record, since the
    /// table only needs to remember the newest emptiness per PK.
    pub fn append(&self, pk: Fingerprint, epoch: u32) -> Result<()> {
        if let Some(existing) = self.get_epoch(pk) {
            if existing >= epoch {
                return Ok(());
            }
        }
        let mut buf = Vec::with_capacity(20);
        buf.extend_from_slice(&pk.to_bytes());
        buf.extend_from_slice(&epoch.to_le_bytes());
        self.log.append(&buf)?;
        self.current.lock().insert(pk, epoch);
        Ok(())
    }

    /// `cache_log::clean`'s step (a): snapshot `current` into `old` and
    /// clear it, so lookups during the checkpoint still see prior
    /// state while new `append`s build the next checkpoint's content.
    pub fn checkpoint_begin(&self) {
        let mut current = self.current.lock();
        let snapshot = std::mem::take(&mut *current);
        *self.old.lock() = Some(snapshot);
    }

    /// `cache_log::clean`'s step (f): commit the (always-empty)
    /// checkpoint and discard the superseded snapshot. Unlike
    /// `used_ci_log` and `cache_log`, this does not prune segments --
    /// §4.9's commit order never lists an empty-PK-log prune step, and
    /// the checkpoint body carries no content to make segments
    /// redundant against.
    pub fn checkpoint_end(&self) -> Result<()> {
        self.log.commit_checkpoint(&[])?;
        *self.old.lock() = None;
        Ok(())
    }
}

fn decode_record(rec: &[u8]) -> Option<(Fingerprint, u32)> {
    if rec.len() != 20 {
        return None;
    }
    let pk = Fingerprint::from_bytes(rec[0..16].try_into().ok()?);
    let epoch = u32::from_le_bytes(rec[16..20].try_into().ok()?);
    Some((pk, epoch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_dedups_against_not_strictly_newer_epoch() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EmptyPkLog::open(tmp.path().join("e")).unwrap();
        let pk = Fingerprint::of_bytes(b"pk");
        log.append(pk, 5).unwrap();
        log.append(pk, 3).unwrap();
        log.append(pk, 5).unwrap();
        assert_eq!(log.get_epoch(pk), Some(5));
        log.append(pk, 9).unwrap();
        assert_eq!(log.get_epoch(pk), Some(9));
    }

    #[test]
    fn recovers_max_epoch_per_pk_from_segments() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("e");
        let pk = Fingerprint::of_bytes(b"pk");
        {
            let log = EmptyPkLog::open(root.clone()).unwrap();
            log.append(pk, 1).unwrap();
            log.append(pk, 4).unwrap();
        }
        let reopened = EmptyPkLog::open(root).unwrap();
        assert_eq!(reopened.get_epoch(pk), Some(4));
    }

    #[test]
    fn checkpoint_cycle_preserves_visibility_then_clears() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EmptyPkLog::open(tmp.path().join("e")).unwrap();
        let pk = Fingerprint::of_bytes(b"pk");
        log.append(pk, 2).unwrap();
        log.checkpoint_begin();
        assert_eq!(log.get_epoch(pk), Some(2));
        log.checkpoint_end().unwrap();
        assert_eq!(log.get_epoch(pk), None);
    }
}
