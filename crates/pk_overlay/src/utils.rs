//! Filesystem helpers shared by the repack driver, the library and the applier.

use std::fs::File;
use std::io::{self, Read};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};

/// Create a temp file next to `target`, so that persisting it is a same-volume rename.
pub fn temp_file_for(target: &Utf8Path) -> Result<NamedTempFile> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    std::fs::create_dir_all(parent.as_std_path())?;
    Ok(NamedTempFile::new_in(parent.as_std_path())?)
}

/// Atomically move a finished temp file over `target`.
pub fn persist(temp: NamedTempFile, target: &Utf8Path) -> Result<()> {
    temp.as_file().sync_all()?;
    temp.persist(target.as_std_path())
        .map_err(|e| Error::PartialWrite {
            path: target.to_path_buf(),
            source: e.error,
        })?;
    Ok(())
}

/// Stream `reader` into `target` through a temp file. Returns the number of bytes written.
pub fn write_atomic(target: &Utf8Path, reader: &mut dyn Read) -> Result<u64> {
    let mut temp = temp_file_for(target)?;
    let written = io::copy(reader, &mut temp)?;
    persist(temp, target)?;
    Ok(written)
}

/// Copy `from` over `to` atomically.
pub fn copy_atomic(from: &Utf8Path, to: &Utf8Path) -> Result<u64> {
    let mut file = File::open(from.as_std_path())?;
    write_atomic(to, &mut file)
}

/// Remove a file, treating "not found" as success. Returns whether a file was removed.
pub fn remove_file_if_exists(path: &Utf8Path) -> Result<bool> {
    match std::fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Fingerprint a set of files from their relative path, size and modification time.
///
/// Missing files contribute their path only, so deleting a file changes the result.
pub fn fingerprint_files<'a>(root: &Utf8Path, paths: impl IntoIterator<Item = &'a Utf8Path>) -> u64 {
    let mut hasher_input = Vec::new();

    for path in paths {
        hasher_input.extend_from_slice(path.as_str().as_bytes());
        hasher_input.push(0);

        if let Ok(metadata) = std::fs::metadata(root.join(path).as_std_path()) {
            hasher_input.extend_from_slice(&metadata.len().to_le_bytes());
            if let Ok(modified) = metadata.modified() {
                if let Ok(duration) = modified.duration_since(std::time::UNIX_EPOCH) {
                    hasher_input.extend_from_slice(&duration.as_nanos().to_le_bytes());
                }
            }
        }
    }

    xxh3_64(&hasher_input)
}

/// Convert a std path from a directory walk, skipping non-UTF-8 names.
pub(crate) fn utf8_path(path: std::path::PathBuf) -> Option<Utf8PathBuf> {
    match Utf8PathBuf::from_path_buf(path) {
        Ok(path) => Some(path),
        Err(path) => {
            tracing::warn!("Skipping non-UTF-8 path: {}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn root(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_write_atomic_creates_parents() {
        let dir = tempdir().unwrap();
        let target = root(&dir).join("a/b/c.txt");

        let written = write_atomic(&target, &mut &b"hello"[..]).unwrap();

        assert_eq!(written, 5);
        assert_eq!(std::fs::read(target.as_std_path()).unwrap(), b"hello");
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let dir = tempdir().unwrap();
        let target = root(&dir).join("c.txt");
        std::fs::write(target.as_std_path(), b"old contents").unwrap();

        write_atomic(&target, &mut &b"new"[..]).unwrap();

        assert_eq!(std::fs::read(target.as_std_path()).unwrap(), b"new");
        // only the target is left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_remove_file_if_exists() {
        let dir = tempdir().unwrap();
        let target = root(&dir).join("gone.txt");
        std::fs::write(target.as_std_path(), b"x").unwrap();

        assert!(remove_file_if_exists(&target).unwrap());
        assert!(!remove_file_if_exists(&target).unwrap());
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let dir = tempdir().unwrap();
        let root = root(&dir);
        let file = Utf8Path::new("f.bin");
        std::fs::write(root.join(file).as_std_path(), b"one").unwrap();

        let first = fingerprint_files(&root, [file]);
        assert_eq!(first, fingerprint_files(&root, [file]));

        std::fs::write(root.join(file).as_std_path(), b"three").unwrap();
        assert_ne!(first, fingerprint_files(&root, [file]));

        std::fs::remove_file(root.join(file).as_std_path()).unwrap();
        assert_ne!(first, fingerprint_files(&root, [file]));
    }
}
