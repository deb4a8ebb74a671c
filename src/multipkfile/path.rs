//! `gran-NN/<hex arcs>` path scheme and atomic publish, per spec.md
//! §4.4. Grounded on `rusty-db`'s `write_file_atomic` (temp file in the
//! same directory, fsync, rename) generalized to binary content and a
//! nested directory scheme.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};
use crate::fp::Fingerprint;

/// `path(prefix) = gran-NN/<hex arcs of prefix>` where NN is
/// `granularity` (number of prefix bytes) and each arc is `arc_bits`
/// wide (never spanning a byte boundary, so arc_bits <= 8).
pub fn mpk_path(root: &Path, pk: &Fingerprint, granularity: u8, arc_bits: u8) -> PathBuf {
    let bytes = pk.to_bytes();
    let prefix_bytes = (granularity as usize).min(bytes.len());
    let mut dir = root.join(format!("gran-{granularity:02}"));

    let mask: u8 = if arc_bits >= 8 { 0xff } else { (1u8 << arc_bits) - 1 };
    let arcs_per_byte = (8 / arc_bits.max(1)).max(1) as usize;
    for &b in &bytes[..prefix_bytes] {
        for shift in (0..arcs_per_byte).rev() {
            let arc = (b >> (shift as u8 * arc_bits)) & mask;
            dir = dir.join(format!("{arc:02x}"));
        }
    }
    dir.join(format!("{pk}.mpk"))
}

/// The canonical representative fingerprint for the MultiPKFile group
/// `pk` belongs to: `pk`'s first `granularity` bytes, with the rest
/// zeroed. Every PK sharing a prefix maps to the same representative,
/// so it doubles as the VM table key and, fed back into `mpk_path`, as
/// the one on-disk file every member PK's rewrite targets -- `mpk_path`
/// only reads the first `granularity` bytes of whatever fingerprint it
/// is given, so two fingerprints that agree on those bytes produce an
/// identical path.
pub fn prefix_of(pk: &Fingerprint, granularity: u8) -> Fingerprint {
    let mut bytes = pk.to_bytes();
    let prefix_bytes = (granularity as usize).min(bytes.len());
    for b in &mut bytes[prefix_bytes..] {
        *b = 0;
    }
    Fingerprint::from_bytes(&bytes)
}

/// Write `content` to `path` atomically: write to a sibling temp file
/// in the same directory, fsync, then rename over the target.
/// Directories are created lazily.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CacheError::Corruption(format!("multipkfile path has no parent: {path:?}")))?;
    fs::create_dir_all(parent)?;

    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("mpk"),
        std::process::id()
    ));

    let mut file = fs::File::create(&temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Delete an empty MultiPKFile and prune parent `gran-NN/...`
/// directories upward while they're empty, stopping at `root`.
pub fn prune_empty_parents(path: &Path, root: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    let mut dir = path.parent().map(Path::to_path_buf);
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        match fs::read_dir(&d) {
            Ok(mut entries) if entries.next().is_none() => {
                fs::remove_dir(&d)?;
                dir = d.parent().map(Path::to_path_buf);
            }
            _ => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_of_is_shared_by_same_prefix_pks() {
        let a = Fingerprint::new(0x0102_0304_0506_0708, 0xaaaa);
        let b = Fingerprint::new(0x0102_0304_0506_0708, 0xbbbb);
        assert_eq!(prefix_of(&a, 2), prefix_of(&b, 2));
        assert_eq!(
            mpk_path(Path::new("/cache"), &a, 2, 8),
            mpk_path(Path::new("/cache"), &prefix_of(&a, 2), 2, 8)
        );
    }

    #[test]
    fn path_nests_by_granularity_and_arc_width() {
        let pk = Fingerprint::new(0x0102_0304_0506_0708, 0);
        let p = mpk_path(Path::new("/cache"), &pk, 2, 8);
        let s = p.to_string_lossy();
        assert!(s.starts_with("/cache/gran-02/01/02/"));
        assert!(s.ends_with(".mpk"));
    }

    #[test]
    fn write_atomic_then_prune_empty_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let pk = Fingerprint::of_bytes(b"prune-test");
        let path = mpk_path(tmp.path(), &pk, 1, 8);
        write_atomic(&path, b"hello").unwrap();
        assert!(path.exists());
        assert_eq!(fs::read(&path).unwrap(), b"hello");

        prune_empty_parents(&path, tmp.path()).unwrap();
        assert!(!path.exists());
        // gran-01 and its arc directories should have been pruned away.
        let mut remaining = fs::read_dir(tmp.path()).unwrap();
        assert!(remaining.next().is_none());
    }
}
