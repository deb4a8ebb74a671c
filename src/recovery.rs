//! Startup recovery (spec.md §4.9 commit order, testable property 2).
//! `original_source`'s `VCache.C` drives an explicit sequence on
//! startup across the four logs; this module formalizes it: rebuild
//! `used_cis` from the used-CI log, then filter the cache-log's
//! surviving records against the stable MultiPKFiles and the empty-PK
//! log so only entries genuinely missing from disk are replayed back
//! into a fresh `VolatilePKFile`.

use crate::bitset::NameSet;
use crate::error::Result;
use crate::fp::Fingerprint;
use crate::logs::cache_log::{CacheLog, CacheLogRecord};
use crate::logs::empty_pk_log::EmptyPkLog;
use crate::logs::used_ci_log::UsedCiLog;

pub struct RecoveredState {
    pub used_cis: NameSet,
    /// Cache-log records not yet reflected on stable disk, in the
    /// order they were originally logged -- replaying them in order
    /// reproduces each PK's `all_names`/`pk_epoch` history.
    pub live_cache_entries: Vec<CacheLogRecord>,
}

/// `stable_epoch(pk)` should answer the on-disk PKFile's current
/// `pk_epoch` for `pk`, or `None` if no stable PKFile for it exists;
/// callers look this up via the MultiPKFile the PK's prefix maps to.
pub fn recover(
    used_ci_log: &UsedCiLog,
    cache_log: &CacheLog,
    empty_pk_log: &EmptyPkLog,
    stable_epoch: impl Fn(Fingerprint) -> Option<u32>,
) -> Result<RecoveredState> {
    let used_cis = used_ci_log.recover()?;

    let mut live_cache_entries = Vec::new();
    for rec in cache_log.recover()? {
        let superseded_by_stable = stable_epoch(rec.pk).is_some_and(|e| e >= rec.pk_epoch);
        let superseded_by_empty = empty_pk_log.get_epoch(rec.pk).is_some_and(|e| e >= rec.pk_epoch);
        if !superseded_by_stable && !superseded_by_empty {
            live_cache_entries.push(rec);
        }
    }

    Ok(RecoveredState {
        used_cis,
        live_cache_entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::used_ci_log::UsedCiOp;

    fn sample(pk: Fingerprint, pk_epoch: u32, ci: u32) -> CacheLogRecord {
        CacheLogRecord {
            source_func: "f".into(),
            pk,
            pk_epoch,
            ci,
            value: vec![9],
            model: 1,
            kids: vec![],
            names: vec!["a".into()],
            fps: vec![Fingerprint::of_bytes(b"a")],
        }
    }

    #[test]
    fn recover_filters_entries_superseded_by_stable_or_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let used_ci_log = UsedCiLog::open(tmp.path().join("u")).unwrap();
        let cache_log = CacheLog::open(tmp.path().join("c")).unwrap();
        let empty_pk_log = EmptyPkLog::open(tmp.path().join("e")).unwrap();

        used_ci_log.append(UsedCiOp::Add, 0, 2).unwrap();

        let stale_pk = Fingerprint::of_bytes(b"stale");
        let live_pk = Fingerprint::of_bytes(b"live");
        let empty_pk = Fingerprint::of_bytes(b"empty");
        cache_log.append(&sample(stale_pk, 1, 0)).unwrap();
        cache_log.append(&sample(live_pk, 3, 1)).unwrap();
        cache_log.append(&sample(empty_pk, 2, 2)).unwrap();
        empty_pk_log.append(empty_pk, 5).unwrap();

        let recovered = recover(&used_ci_log, &cache_log, &empty_pk_log, |pk| {
            if pk == stale_pk {
                Some(1)
            } else {
                None
            }
        })
        .unwrap();

        assert!(recovered.used_cis.test(0) && recovered.used_cis.test(1) && recovered.used_cis.test(2));
        assert_eq!(recovered.live_cache_entries.len(), 1);
        assert_eq!(recovered.live_cache_entries[0].pk, live_pk);
    }
}
