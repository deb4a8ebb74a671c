//! Stable scalars (spec.md §6): two atomically-written single-value
//! files under the cache metadata root, `deleting` and `hit_filter`,
//! reflecting the weeder state machine's durable fields (§3 "Cache-
//! wide state"). Grounded on `multipkfile::path::write_atomic`'s
//! temp-file-then-rename publication, generalized to whole-file
//! scalars instead of MultiPKFiles.

use std::fs;
use std::path::Path;

use crate::bitset::NameSet;
use crate::error::Result;
use crate::multipkfile::path::write_atomic;

const DELETING_FILE: &str = "deleting";
const HIT_FILTER_FILE: &str = "hit_filter";

pub fn read_deleting(root: &Path) -> Result<bool> {
    match fs::read(root.join(DELETING_FILE)) {
        Ok(bytes) => Ok(bytes.first().copied().unwrap_or(0) != 0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub fn write_deleting(root: &Path, deleting: bool) -> Result<()> {
    write_atomic(&root.join(DELETING_FILE), &[deleting as u8])
}

pub fn read_hit_filter(root: &Path) -> Result<NameSet> {
    match fs::read(root.join(HIT_FILTER_FILE)) {
        Ok(bytes) => Ok(NameSet::decode(&bytes)?.0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NameSet::new()),
        Err(e) => Err(e.into()),
    }
}

pub fn write_hit_filter(root: &Path, hit_filter: &NameSet) -> Result<()> {
    write_atomic(&root.join(HIT_FILTER_FILE), &hit_filter.encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleting_round_trips_and_defaults_false() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!read_deleting(tmp.path()).unwrap());
        write_deleting(tmp.path(), true).unwrap();
        assert!(read_deleting(tmp.path()).unwrap());
        write_deleting(tmp.path(), false).unwrap();
        assert!(!read_deleting(tmp.path()).unwrap());
    }

    #[test]
    fn hit_filter_round_trips_and_defaults_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_hit_filter(tmp.path()).unwrap().is_empty());
        let mut bv = NameSet::new();
        bv.set(3);
        bv.set(70);
        write_hit_filter(tmp.path(), &bv).unwrap();
        assert_eq!(read_hit_filter(tmp.path()).unwrap(), bv);
    }
}
