//! Shared append/checkpoint/prune machinery for the four write-ahead
//! logs in this module (spec.md §2 component H, §6 "Log files").
//! Grounded on `rusty-db`'s `transaction/wal.rs`: CRC-checksummed,
//! length-prefixed records (there via hardware-accelerated CRC32C,
//! here via the `crc32c` crate the teacher also depends on), and a
//! reader that treats a failed decode as end-of-log rather than an
//! error (`WriteAheadLog::read_from`'s `Err(_) => break`) -- a
//! segment's tail can be a torn write left by a crash mid-append.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;

/// One append-only log directory: a `checkpoint` file plus a sequence
/// of numbered `NNNNNNNNNN.seg` segments.
pub struct SegmentLog {
    root: PathBuf,
    writer: Mutex<ActiveSegment>,
}

struct ActiveSegment {
    index: u64,
    file: BufWriter<File>,
}

impl SegmentLog {
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        let index = Self::segment_indices(&root)?.last().copied().unwrap_or(0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::segment_path(&root, index))?;
        Ok(Self {
            root,
            writer: Mutex::new(ActiveSegment {
                index,
                file: BufWriter::new(file),
            }),
        })
    }

    fn segment_path(root: &Path, index: u64) -> PathBuf {
        root.join(format!("{index:010}.seg"))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join("checkpoint")
    }

    fn segment_indices(root: &Path) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if let Some(stem) = entry.file_name().to_str().and_then(|n| n.strip_suffix(".seg")) {
                if let Ok(idx) = stem.parse::<u64>() {
                    out.push(idx);
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Append one record. Durability for the commit path (§4.9):
    /// flushed and fsync'd before returning.
    pub fn append(&self, payload: &[u8]) -> Result<()> {
        let mut w = self.writer.lock();
        write_record(&mut w.file, payload)?;
        w.file.flush()?;
        w.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Close the active segment and open the next one, returning the
    /// index of the segment that was just closed off. Used by
    /// `GraphLog::begin_checkpoint` (§4.10 `start_mark`, "flush
    /// graph-log ... start a new checkpoint").
    pub fn roll(&self) -> Result<u64> {
        let mut w = self.writer.lock();
        w.file.flush()?;
        let closed = w.index;
        let next = closed + 1;
        w.file = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(Self::segment_path(&self.root, next))?,
        );
        w.index = next;
        Ok(closed)
    }

    pub fn read_checkpoint(&self) -> Result<Option<Vec<u8>>> {
        let path = self.checkpoint_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    /// Every record across every segment currently on disk, in
    /// ascending segment order.
    pub fn read_all_segments(&self) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for idx in Self::segment_indices(&self.root)? {
            let bytes = fs::read(Self::segment_path(&self.root, idx))?;
            out.extend(read_records(&bytes));
        }
        Ok(out)
    }

    /// Atomically publish a new checkpoint body. Does not prune the
    /// segments it supersedes -- callers that want compaction call
    /// `prune` explicitly afterward, matching the distinct steps in
    /// spec.md §4.7/§4.9 ("writes ... to a new checkpoint, commits,
    /// prunes").
    pub fn commit_checkpoint(&self, body: &[u8]) -> Result<()> {
        crate::multipkfile::path::write_atomic(&self.checkpoint_path(), body)
    }

    /// Delete every segment file (the checkpoint is assumed to already
    /// capture anything worth keeping) and start a fresh active one.
    pub fn prune(&self) -> Result<()> {
        let indices = Self::segment_indices(&self.root)?;
        let mut w = self.writer.lock();
        w.file.flush()?;
        for idx in &indices {
            let _ = fs::remove_file(Self::segment_path(&self.root, *idx));
        }
        let next = indices.last().copied().unwrap_or(w.index) + 1;
        w.file = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(Self::segment_path(&self.root, next))?,
        );
        w.index = next;
        Ok(())
    }
}

pub(crate) fn write_record(w: &mut impl Write, payload: &[u8]) -> Result<()> {
    let crc = crc32c::crc32c(payload);
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(payload)?;
    Ok(())
}

/// Decode every whole record in `bytes`, stopping at the first
/// length/checksum mismatch rather than erroring.
pub(crate) fn read_records(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut off = 0usize;
    while off + 8 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(bytes[off + 4..off + 8].try_into().unwrap());
        let start = off + 8;
        if start + len > bytes.len() {
            break;
        }
        let payload = &bytes[start..start + len];
        if crc32c::crc32c(payload) != crc {
            break;
        }
        out.push(payload.to_vec());
        off = start + len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let log = SegmentLog::open(tmp.path().join("l")).unwrap();
        log.append(b"one").unwrap();
        log.append(b"two").unwrap();
        let recs = log.read_all_segments().unwrap();
        assert_eq!(recs, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn torn_tail_is_ignored() {
        let mut bytes = Vec::new();
        write_record(&mut bytes, b"whole").unwrap();
        bytes.extend_from_slice(&99u32.to_le_bytes()); // claims a 99-byte record
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(b"short"); // but only 5 bytes follow
        let recs = read_records(&bytes);
        assert_eq!(recs, vec![b"whole".to_vec()]);
    }

    #[test]
    fn roll_closes_current_and_opens_next() {
        let tmp = tempfile::tempdir().unwrap();
        let log = SegmentLog::open(tmp.path().join("l")).unwrap();
        log.append(b"a").unwrap();
        let closed = log.roll().unwrap();
        assert_eq!(closed, 0);
        log.append(b"b").unwrap();
        let recs = log.read_all_segments().unwrap();
        assert_eq!(recs, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn checkpoint_then_prune_drops_old_segments() {
        let tmp = tempfile::tempdir().unwrap();
        let log = SegmentLog::open(tmp.path().join("l")).unwrap();
        log.append(b"a").unwrap();
        log.append(b"b").unwrap();
        log.commit_checkpoint(b"snapshot").unwrap();
        log.prune().unwrap();
        assert!(log.read_all_segments().unwrap().is_empty());
        assert_eq!(log.read_checkpoint().unwrap().unwrap(), b"snapshot");
    }
}
