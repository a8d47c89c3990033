//! Atomic filesystem primitives.
//!
//! Every persisted file in the system goes through [`write_atomic`]: a temp
//! file created in the destination directory, fully written and fsynced, mode
//! pinned explicitly, then renamed over the target. A reader can observe the
//! old contents or the new contents, never a truncated file. Modes are never
//! left to the process umask.

use std::fs::Permissions;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const TEMP_PREFIX: &str = ".macblock-";
const TEMP_SUFFIX: &str = ".tmp";

/// Creates `path` (and parents) if missing and pins its mode.
pub fn ensure_dir(path: &Path, mode: u32) -> io::Result<()> {
    std::fs::create_dir_all(path)?;
    std::fs::set_permissions(path, Permissions::from_mode(mode))
}

/// Writes `bytes` to `path` via temp-file-and-rename in the same directory.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.as_file().set_permissions(Permissions::from_mode(mode))?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Removes temp files a crashed writer may have left in `dir`.
///
/// Only files matching our own prefix/suffix are touched. Returns how many
/// were removed; per-file errors are skipped (another process may race us).
pub fn remove_stale_temps(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) {
            if std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn test_write_atomic_pins_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        write_atomic(&path, b"hello\n", 0o644).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o644);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        write_atomic(&path, b"one", 0o644).unwrap();
        write_atomic(&path, b"two", 0o600).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o600);
    }

    #[test]
    fn test_write_atomic_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/out.txt");
        write_atomic(&path, b"x", 0o644).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_remove_stale_temps_only_ours() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".macblock-abc.tmp"), b"junk").unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"data").unwrap();

        let removed = remove_stale_temps(dir.path()).unwrap();
        assert_eq!(removed, 1);
        assert!(dir.path().join("keep.txt").exists());
        assert!(!dir.path().join(".macblock-abc.tmp").exists());
    }

    #[test]
    fn test_ensure_dir_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        ensure_dir(&sub, 0o755).unwrap();
        ensure_dir(&sub, 0o755).unwrap();
        let meta = std::fs::metadata(&sub).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o755);
    }
}
