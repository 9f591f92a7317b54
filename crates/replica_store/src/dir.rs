//! Store directory management.
//!
//! ```text
//! <root>/
//! ├─ LOCK          # Advisory lock for single-writer
//! ├─ journal.log   # Commit journal
//! ├─ SNAPSHOT      # Latest checkpoint image
//! └─ staging/      # Upload content owned by the replica
//! ```

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.log";
const SNAPSHOT_FILE: &str = "SNAPSHOT";
const STAGING_DIR: &str = "staging";

/// An opened store directory.
///
/// Holds an exclusive lock on `LOCK` for as long as it lives, so only one
/// process at a time can write to the store.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another process holds the lock, or an
    /// I/O error if the directory is missing and `create_if_missing` is false.
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("store directory does not exist: {}", path.display()),
                )));
            }
        }
        if !path.is_dir() {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path is not a directory: {}", path.display()),
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the root path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the journal path.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.path.join(JOURNAL_FILE)
    }

    /// Returns the snapshot path.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE)
    }

    /// Returns the staging directory path.
    #[must_use]
    pub fn staging_path(&self) -> PathBuf {
        self.path.join(STAGING_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_missing_directory() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("replica");
        let dir = StoreDir::open(&root, true).unwrap();
        assert!(root.join(LOCK_FILE).exists());
        assert_eq!(dir.journal_path(), root.join("journal.log"));
        assert_eq!(dir.staging_path(), root.join("staging"));
    }

    #[test]
    fn missing_directory_without_create() {
        let temp = tempdir().unwrap();
        let result = StoreDir::open(&temp.path().join("absent"), false);
        assert!(matches!(result, Err(StoreError::Io(_))));
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let _first = StoreDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            StoreDir::open(temp.path(), true),
            Err(StoreError::Locked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(StoreDir::open(temp.path(), true).unwrap());
        assert!(StoreDir::open(temp.path(), true).is_ok());
    }
}
