//! Graph-log (spec.md §4.8/§4.10): one node per entry once child-CI
//! leases are validated, plus "root" records per client `Checkpoint`
//! call, and the weeder's pruned-checkpoint hand-off protocol
//! (`begin_checkpoint` / `commit_chkpt`).

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{CacheError, Result};
use crate::logs::segment::{read_records, write_record, SegmentLog};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphLogRecord {
    Node { ci: u32, kids: Vec<u32> },
    Root { cis: Vec<u32> },
}

pub struct GraphLog {
    root: PathBuf,
    log: SegmentLog,
    /// Version of the checkpoint currently pending hand-off to an
    /// external weeder via `commit_chkpt`, per §4.10.
    chkpt_ver: Mutex<Option<u64>>,
}

impl GraphLog {
    pub fn open(root: PathBuf) -> Result<Self> {
        Ok(Self {
            log: SegmentLog::open(root.clone())?,
            root,
            chkpt_ver: Mutex::new(None),
        })
    }

    /// Append a node once its child CIs are confirmed leased (§4.11
    /// `add_entry`'s "If all kids leased, write a graph-log node").
    pub fn append_node(&self, ci: u32, kids: &[u32]) -> Result<()> {
        let mut buf = vec![0u8];
        buf.extend_from_slice(&ci.to_le_bytes());
        buf.extend_from_slice(&(kids.len() as u32).to_le_bytes());
        for k in kids {
            buf.extend_from_slice(&k.to_le_bytes());
        }
        self.log.append(&buf)
    }

    /// Append a root record for a client `Checkpoint` call (§4.11).
    pub fn append_root(&self, cis: &[u32]) -> Result<()> {
        let mut buf = vec![1u8];
        buf.extend_from_slice(&(cis.len() as u32).to_le_bytes());
        for c in cis {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        self.log.append(&buf)
    }

    /// `start_mark`'s "flush graph-log, abort any stale graph-log
    /// checkpoint, start a new checkpoint": close off the active
    /// segment (everything appended to it becomes the pending
    /// checkpoint's content) and remember its index as the version an
    /// external weeder must prune and hand back via `commit_chkpt`.
    pub fn begin_checkpoint(&self) -> Result<u64> {
        self.abort_checkpoint();
        let version = self.log.roll()?;
        *self.chkpt_ver.lock() = Some(version);
        Ok(version)
    }

    pub fn abort_checkpoint(&self) {
        *self.chkpt_ver.lock() = None;
    }

    pub fn pending_checkpoint_version(&self) -> Option<u64> {
        *self.chkpt_ver.lock()
    }

    fn checkpoint_file_name(version: u64) -> String {
        format!("{version:010}.ckp")
    }

    pub fn checkpoint_path(&self, version: u64) -> PathBuf {
        self.root.join(Self::checkpoint_file_name(version))
    }

    /// `commit_chkpt(name)` (§4.10): accept a client-supplied pruned
    /// checkpoint file only when a checkpoint is pending, `supplied`'s
    /// file name matches the expected `/NN.ckp` path under the
    /// graph-log root, and it exists; on success rename it into place
    /// and finalize. On any rejection, delete the supplied file and
    /// return false.
    pub fn commit_chkpt(&self, supplied: &Path) -> Result<bool> {
        let mut ver_guard = self.chkpt_ver.lock();
        let version = match *ver_guard {
            Some(v) => v,
            None => {
                let _ = fs::remove_file(supplied);
                return Ok(false);
            }
        };
        let expected = self.checkpoint_path(version);
        let name_matches = supplied.file_name() == expected.file_name();
        if !name_matches || !supplied.exists() {
            let _ = fs::remove_file(supplied);
            return Ok(false);
        }
        fs::rename(supplied, &expected)?;
        *ver_guard = None;
        Ok(true)
    }

    /// Every surviving node/root record, for recovery and for the
    /// weeder's mark phase: finalized `.ckp` checkpoints (in version
    /// order) followed by active `.seg` segments, skipping any `.seg`
    /// whose content was already superseded by a same-numbered `.ckp`.
    pub fn recover(&self) -> Result<Vec<GraphLogRecord>> {
        let mut ckp_versions: Vec<u64> = Vec::new();
        let mut seg_versions: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".ckp") {
                if let Ok(v) = stem.parse::<u64>() {
                    ckp_versions.push(v);
                }
            } else if let Some(stem) = name.strip_suffix(".seg") {
                if let Ok(v) = stem.parse::<u64>() {
                    seg_versions.push(v);
                }
            }
        }
        ckp_versions.sort_unstable();
        seg_versions.sort_unstable();

        let mut out = Vec::new();
        for v in &ckp_versions {
            let bytes = fs::read(self.checkpoint_path(*v))?;
            for rec in read_records(&bytes) {
                out.push(decode_record(&rec)?);
            }
        }
        for v in &seg_versions {
            if ckp_versions.contains(v) {
                continue;
            }
            let bytes = fs::read(self.root.join(format!("{v:010}.seg")))?;
            for rec in read_records(&bytes) {
                out.push(decode_record(&rec)?);
            }
        }
        Ok(out)
    }
}

fn decode_record(rec: &[u8]) -> Result<GraphLogRecord> {
    if rec.is_empty() {
        return Err(CacheError::Corruption("graph-log: empty record".into()));
    }
    let mut off = 1;
    match rec[0] {
        0 => {
            if rec.len() < off + 8 {
                return Err(CacheError::Corruption("graph-log: truncated node".into()));
            }
            let ci = u32::from_le_bytes(rec[off..off + 4].try_into().unwrap());
            off += 4;
            let kid_count = u32::from_le_bytes(rec[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            let mut kids = Vec::with_capacity(kid_count);
            for _ in 0..kid_count {
                if rec.len() < off + 4 {
                    return Err(CacheError::Corruption("graph-log: truncated kid".into()));
                }
                kids.push(u32::from_le_bytes(rec[off..off + 4].try_into().unwrap()));
                off += 4;
            }
            Ok(GraphLogRecord::Node { ci, kids })
        }
        1 => {
            if rec.len() < off + 4 {
                return Err(CacheError::Corruption("graph-log: truncated root".into()));
            }
            let count = u32::from_le_bytes(rec[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            let mut cis = Vec::with_capacity(count);
            for _ in 0..count {
                if rec.len() < off + 4 {
                    return Err(CacheError::Corruption("graph-log: truncated root CI".into()));
                }
                cis.push(u32::from_le_bytes(rec[off..off + 4].try_into().unwrap()));
                off += 4;
            }
            Ok(GraphLogRecord::Root { cis })
        }
        other => Err(CacheError::Corruption(format!("graph-log: unknown record tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recover_reads_nodes_and_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let log = GraphLog::open(tmp.path().join("g")).unwrap();
        log.append_node(1, &[]).unwrap();
        log.append_node(2, &[1]).unwrap();
        log.append_root(&[1, 2]).unwrap();
        let recs = log.recover().unwrap();
        assert_eq!(
            recs,
            vec![
                GraphLogRecord::Node { ci: 1, kids: vec![] },
                GraphLogRecord::Node { ci: 2, kids: vec![1] },
                GraphLogRecord::Root { cis: vec![1, 2] },
            ]
        );
    }

    #[test]
    fn commit_chkpt_rejects_without_pending_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let log = GraphLog::open(tmp.path().join("g")).unwrap();
        let bogus = tmp.path().join("bogus.ckp");
        fs::write(&bogus, b"x").unwrap();
        assert!(!log.commit_chkpt(&bogus).unwrap());
        assert!(!bogus.exists());
    }

    #[test]
    fn begin_then_commit_chkpt_finalizes_pending_version() {
        let tmp = tempfile::tempdir().unwrap();
        let log = GraphLog::open(tmp.path().join("g")).unwrap();
        log.append_node(1, &[]).unwrap();
        let version = log.begin_checkpoint().unwrap();
        log.append_node(2, &[1]).unwrap();

        let pruned_path = tmp.path().join("pruned.ckp");
        let mut body = Vec::new();
        write_record(&mut body, &[0, 1, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        fs::write(&pruned_path, body).unwrap();

        // wrong name is rejected
        assert!(!log.commit_chkpt(&pruned_path).unwrap());

        let correctly_named = tmp.path().join(format!("{version:010}.ckp"));
        fs::rename(&pruned_path, &correctly_named).unwrap();
        assert!(log.commit_chkpt(&correctly_named).unwrap());
        assert_eq!(log.pending_checkpoint_version(), None);
    }
}
