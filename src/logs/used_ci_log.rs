//! Used-CI log (spec.md §4.7): interval add/remove records plus a
//! `used_cis` bitset checkpoint, recording which cache indices are
//! live. First in the commit order (§4.9 step 1).

use std::path::PathBuf;

use crate::bitset::NameSet;
use crate::error::{CacheError, Result};
use crate::logs::segment::SegmentLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsedCiOp {
    Add,
    Remove,
}

pub struct UsedCiLog {
    log: SegmentLog,
}

impl UsedCiLog {
    pub fn open(root: PathBuf) -> Result<Self> {
        Ok(Self {
            log: SegmentLog::open(root)?,
        })
    }

    /// Append one `{op, lo, hi}` interval record, fsync'd before
    /// returning -- this is the first write in the commit order
    /// (§4.9 step 1, "new CI interval committed").
    pub fn append(&self, op: UsedCiOp, lo: u32, hi: u32) -> Result<()> {
        let mut buf = Vec::with_capacity(9);
        buf.push(match op {
            UsedCiOp::Add => 0,
            UsedCiOp::Remove => 1,
        });
        buf.extend_from_slice(&lo.to_le_bytes());
        buf.extend_from_slice(&hi.to_le_bytes());
        self.log.append(&buf)
    }

    /// Rebuild `used_cis` at startup: the checkpoint bitset (if any)
    /// plus every interval recorded since.
    pub fn recover(&self) -> Result<NameSet> {
        let mut bits = match self.log.read_checkpoint()? {
            Some(bytes) => NameSet::decode(&bytes)?.0,
            None => NameSet::new(),
        };
        for rec in self.log.read_all_segments()? {
            if let Some((op, lo, hi)) = decode_interval(&rec) {
                apply_interval(&mut bits, op, lo, hi);
            }
        }
        Ok(bits)
    }

    /// `ckpt_used_cis(del)` (§4.7): the caller has already locked out
    /// further log writes and drained the pending interval list; this
    /// subtracts `del` from the live snapshot, persists it as the new
    /// checkpoint, and prunes the segments it supersedes.
    pub fn checkpoint(&self, live: &NameSet, del: &NameSet) -> Result<NameSet> {
        let after = live.difference(del);
        self.log.commit_checkpoint(&after.encode())?;
        self.log.prune()?;
        Ok(after)
    }
}

fn decode_interval(rec: &[u8]) -> Option<(UsedCiOp, u32, u32)> {
    if rec.len() != 9 {
        return None;
    }
    let op = match rec[0] {
        0 => UsedCiOp::Add,
        1 => UsedCiOp::Remove,
        _ => return None,
    };
    let lo = u32::from_le_bytes(rec[1..5].try_into().ok()?);
    let hi = u32::from_le_bytes(rec[5..9].try_into().ok()?);
    Some((op, lo, hi))
}

fn apply_interval(bits: &mut NameSet, op: UsedCiOp, lo: u32, hi: u32) {
    for ci in lo..=hi {
        match op {
            UsedCiOp::Add => bits.set(ci),
            UsedCiOp::Remove => bits.clear_bit(ci),
        }
    }
}

/// `next_avail`: the lowest clear bit in `used`, skipping any bit set
/// in `excluded` (the hit-filter, during a deletion phase) so a
/// re-used CI cannot collide with pending weeding.
pub fn next_avail(used: &NameSet, excluded: Option<&NameSet>) -> Result<u32> {
    let mut ci = 0u32;
    loop {
        let blocked = used.test(ci) || excluded.is_some_and(|e| e.test(ci));
        if !blocked {
            return Ok(ci);
        }
        ci = ci
            .checked_add(1)
            .ok_or_else(|| CacheError::Corruption("used-CI space exhausted".into()))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recover_replays_intervals_over_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let log = UsedCiLog::open(tmp.path().join("l")).unwrap();
        log.append(UsedCiOp::Add, 0, 2).unwrap();
        log.append(UsedCiOp::Remove, 1, 1).unwrap();
        let bits = log.recover().unwrap();
        assert!(bits.test(0));
        assert!(!bits.test(1));
        assert!(bits.test(2));
    }

    #[test]
    fn checkpoint_subtracts_deleted_and_prunes() {
        let tmp = tempfile::tempdir().unwrap();
        let log = UsedCiLog::open(tmp.path().join("l")).unwrap();
        log.append(UsedCiOp::Add, 0, 3).unwrap();
        let live = log.recover().unwrap();
        let del = NameSet::from_indices([2]);
        let after = log.checkpoint(&live, &del).unwrap();
        assert!(!after.test(2));
        assert!(after.test(0));
        let recovered = log.recover().unwrap();
        assert_eq!(recovered, after);
    }

    #[test]
    fn next_avail_skips_used_and_excluded() {
        let used = NameSet::from_indices([0, 1]);
        let excluded = NameSet::from_indices([2]);
        assert_eq!(next_avail(&used, Some(&excluded)).unwrap(), 3);
        assert_eq!(next_avail(&used, None).unwrap(), 2);
    }
}
