//! Project fingerprinting.
//!
//! Computes a deterministic digest of a project tree's content, used as
//! the content address of a build attempt. The walk is sorted so two
//! fingerprints of an unchanged tree are identical, and the builder's own
//! run data directory is excluded so a build does not change the
//! fingerprint of the tree it was computed from.

use std::fs;
use std::path::Path;

use funcforge_core::{BuildError, Result};
use sha2::{Digest, Sha256};

use crate::function::RUN_DATA_DIR;

/// Entries excluded from the fingerprint.
const EXCLUDED: [&str; 2] = [RUN_DATA_DIR, ".git"];

/// Compute the fingerprint of the project tree rooted at `root`.
///
/// Returns a lowercase sha256 hex string.
pub fn fingerprint(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    walk(root, root, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn walk(root: &Path, dir: &Path, hasher: &mut Sha256) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .and_then(|rd| rd.collect::<std::io::Result<Vec<_>>>())
        .map_err(|e| BuildError::Fingerprint(format!("{}: {}", dir.display(), e)))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if EXCLUDED.iter().any(|x| name == *x) {
            continue;
        }
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)
            .map_err(|e| BuildError::Fingerprint(format!("{}: {}", path.display(), e)))?;
        let rel = path.strip_prefix(root).unwrap_or(&path);

        hasher.update(rel.to_string_lossy().as_bytes());
        if meta.file_type().is_symlink() {
            hasher.update(b"L");
            let target = fs::read_link(&path)
                .map_err(|e| BuildError::Fingerprint(format!("{}: {}", path.display(), e)))?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if meta.is_dir() {
            hasher.update(b"D");
            walk(root, &path, hasher)?;
        } else {
            hasher.update(b"F");
            let data = fs::read(&path)
                .map_err(|e| BuildError::Fingerprint(format!("{}: {}", path.display(), e)))?;
            hasher.update(&data);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_is_stable() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub").join("b.txt"), "world").unwrap();

        let one = fingerprint(tmp.path()).unwrap();
        let two = fingerprint(tmp.path()).unwrap();
        assert_eq!(one, two);
        assert_eq!(one.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        let before = fingerprint(tmp.path()).unwrap();

        fs::write(tmp.path().join("a.txt"), "hello world").unwrap();
        let after = fingerprint(tmp.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_fingerprint_ignores_run_data_dir() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        let before = fingerprint(tmp.path()).unwrap();

        fs::create_dir_all(tmp.path().join(RUN_DATA_DIR).join("builds")).unwrap();
        fs::write(tmp.path().join(RUN_DATA_DIR).join("x"), "artifacts").unwrap();
        let after = fingerprint(tmp.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_fingerprint_missing_root() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        assert!(matches!(
            fingerprint(&missing),
            Err(BuildError::Fingerprint(_))
        ));
    }
}
