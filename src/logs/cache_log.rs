//! Cache log (spec.md §4.9/§6): the durable record of a new
//! `CacheEntry` before it is visible in any stable `MultiPKFile`.
//! Third in the commit order (used-CI log, then graph log, then this).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fp::Fingerprint;
use crate::logs::empty_pk_log::EmptyPkLog;
use crate::logs::segment::SegmentLog;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheLogRecord {
    pub source_func: String,
    pub pk: Fingerprint,
    pub pk_epoch: u32,
    pub ci: u32,
    pub value: Vec<u8>,
    pub model: u64,
    pub kids: Vec<u32>,
    pub names: Vec<String>,
    pub fps: Vec<Fingerprint>,
}

pub struct CacheLog {
    log: SegmentLog,
}

fn codec_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

impl CacheLog {
    pub fn open(root: PathBuf) -> Result<Self> {
        Ok(Self {
            log: SegmentLog::open(root)?,
        })
    }

    pub fn append(&self, rec: &CacheLogRecord) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(rec, codec_config())?;
        self.log.append(&bytes)
    }

    /// Every surviving record: the checkpoint body (itself a sequence
    /// of length-prefixed records) followed by the active segments.
    pub fn recover(&self) -> Result<Vec<CacheLogRecord>> {
        let mut out = Vec::new();
        if let Some(bytes) = self.log.read_checkpoint()? {
            for rec in crate::logs::segment::read_records(&bytes) {
                out.push(decode(&rec)?);
            }
        }
        for rec in self.log.read_all_segments()? {
            out.push(decode(&rec)?);
        }
        Ok(out)
    }

    /// `clean()` (§4.9): drop cache-log records that are provably
    /// superseded -- either folded into the stable `MultiPKFile`
    /// already (`stable_epoch(pk)` is at least as new as the record)
    /// or recorded as empty as of a later epoch in the empty-PK log.
    /// Ordered exactly as spec.md lays it out, since the empty-PK
    /// log's own checkpoint must bracket the cache-log's:
    ///
    /// 1. begin the empty-PK log's checkpoint (freezes its view)
    /// 2. gather every live cache-log record
    /// 3. keep only the ones still worth recovering
    /// 4. commit the filtered set as the cache log's new checkpoint
    /// 5. prune the cache log's superseded segments
    /// 6. end the empty-PK log's checkpoint
    pub fn clean(
        &self,
        empty_pk_log: &EmptyPkLog,
        stable_epoch: impl Fn(Fingerprint) -> Option<u32>,
    ) -> Result<usize> {
        empty_pk_log.checkpoint_begin();

        let all = self.recover()?;
        let original_len = all.len();
        let mut keep = Vec::with_capacity(original_len);
        for rec in all {
            let superseded_by_stable = stable_epoch(rec.pk).is_some_and(|e| e >= rec.pk_epoch);
            let superseded_by_empty =
                empty_pk_log.get_epoch(rec.pk).is_some_and(|e| e >= rec.pk_epoch);
            if !superseded_by_stable && !superseded_by_empty {
                keep.push(rec);
            }
        }
        let dropped = original_len - keep.len();

        let mut body = Vec::new();
        for rec in &keep {
            let bytes = bincode::serde::encode_to_vec(rec, codec_config())?;
            crate::logs::segment::write_record(&mut body, &bytes)?;
        }
        self.log.commit_checkpoint(&body)?;
        self.log.prune()?;

        empty_pk_log.checkpoint_end()?;

        Ok(dropped)
    }
}

fn decode(bytes: &[u8]) -> Result<CacheLogRecord> {
    let (rec, _) = bincode::serde::decode_from_slice(bytes, codec_config())?;
    Ok(rec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pk: Fingerprint, pk_epoch: u32, ci: u32) -> CacheLogRecord {
        CacheLogRecord {
            source_func: "f".into(),
            pk,
            pk_epoch,
            ci,
            value: vec![1, 2, 3],
            model: 7,
            kids: vec![],
            names: vec!["x".into()],
            fps: vec![Fingerprint::of_bytes(b"x")],
        }
    }

    #[test]
    fn append_and_recover_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let log = CacheLog::open(tmp.path().join("c")).unwrap();
        let pk = Fingerprint::of_bytes(b"pk");
        let rec = sample(pk, 1, 10);
        log.append(&rec).unwrap();
        let recovered = log.recover().unwrap();
        assert_eq!(recovered, vec![rec]);
    }

    #[test]
    fn clean_drops_records_superseded_by_stable_epoch() {
        let tmp = tempfile::tempdir().unwrap();
        let log = CacheLog::open(tmp.path().join("c")).unwrap();
        let epk = EmptyPkLog::open(tmp.path().join("e")).unwrap();
        let pk = Fingerprint::of_bytes(b"pk");
        log.append(&sample(pk, 1, 10)).unwrap();
        log.append(&sample(pk, 2, 11)).unwrap();

        let dropped = log
            .clean(&epk, |candidate| if candidate == pk { Some(1) } else { None })
            .unwrap();
        assert_eq!(dropped, 1);
        let remaining = log.recover().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].pk_epoch, 2);
    }

    #[test]
    fn clean_drops_records_superseded_by_empty_pk_log() {
        let tmp = tempfile::tempdir().unwrap();
        let log = CacheLog::open(tmp.path().join("c")).unwrap();
        let epk = EmptyPkLog::open(tmp.path().join("e")).unwrap();
        let pk = Fingerprint::of_bytes(b"pk");
        epk.append(pk, 5).unwrap();
        log.append(&sample(pk, 3, 10)).unwrap();

        let dropped = log.clean(&epk, |_| None).unwrap();
        assert_eq!(dropped, 1);
        assert!(log.recover().unwrap().is_empty());
    }
}
