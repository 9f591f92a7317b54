//! File-backed media.

use crate::backend::{LogDevice, SnapshotSlot};
use crate::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A journal log stored in a single OS file.
///
/// - `append` writes at the end of the file
/// - `sync` calls `File::sync_data`, so an acknowledged commit is on disk
#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    file: Mutex<File>,
    len: u64,
}

impl FileLog {
    /// Opens or creates the log at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            len,
        })
    }

    /// Returns the path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogDevice for FileLog {
    fn len(&self) -> StoreResult<u64> {
        Ok(self.len)
    }

    fn read_from(&self, offset: u64) -> StoreResult<Vec<u8>> {
        if offset > self.len {
            return Err(StoreError::corrupted(format!(
                "read offset {offset} beyond log length {}",
                self.len
            )));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity((self.len - offset) as usize);
        Read::by_ref(&mut *file).take(self.len - offset).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn append(&mut self, bytes: &[u8]) -> StoreResult<u64> {
        let offset = self.len;
        if bytes.is_empty() {
            return Ok(offset);
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        self.len += bytes.len() as u64;
        Ok(offset)
    }

    fn sync(&mut self) -> StoreResult<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> StoreResult<()> {
        if len > self.len {
            return Err(StoreError::corrupted(format!(
                "cannot truncate log of {} bytes to {len}",
                self.len
            )));
        }
        let file = self.file.lock();
        file.set_len(len)?;
        file.sync_all()?;
        self.len = len;
        Ok(())
    }
}

/// A snapshot slot stored as one file, replaced via write-temp-then-rename.
#[derive(Debug)]
pub struct FileSnapshot {
    path: PathBuf,
    temp_path: PathBuf,
}

impl FileSnapshot {
    /// Creates a slot at `path`; nothing is touched until the first save.
    #[must_use]
    pub fn new(path: &Path) -> Self {
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        Self {
            path: path.to_path_buf(),
            temp_path: path.with_file_name(temp_name),
        }
    }

    /// Returns the path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn sync_parent(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl SnapshotSlot for FileSnapshot {
    fn load(&self) -> StoreResult<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, image: &[u8]) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&self.temp_path)?;
        file.write_all(image)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.temp_path, &self.path)?;
        self.sync_parent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn log_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        {
            let mut log = FileLog::open(&path).unwrap();
            log.append(b"first").unwrap();
            log.append(b"second").unwrap();
            log.sync().unwrap();
        }

        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.len().unwrap(), 11);
        assert_eq!(log.read_from(5).unwrap(), b"second");
    }

    #[test]
    fn log_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("journal.log");
        let log = FileLog::open(&path).unwrap();
        assert!(log.is_empty().unwrap());
        assert!(path.exists());
    }

    #[test]
    fn log_truncate() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(&dir.path().join("journal.log")).unwrap();
        log.append(b"keep-drop").unwrap();
        log.truncate(4).unwrap();
        assert_eq!(log.read_from(0).unwrap(), b"keep");
        assert!(log.truncate(10).is_err());

        // appends continue at the new end
        assert_eq!(log.append(b"!").unwrap(), 4);
    }

    #[test]
    fn snapshot_missing_is_none() {
        let dir = tempdir().unwrap();
        let slot = FileSnapshot::new(&dir.path().join("SNAPSHOT"));
        assert!(slot.load().unwrap().is_none());
    }

    #[test]
    fn snapshot_save_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("SNAPSHOT");
        let mut slot = FileSnapshot::new(&path);
        slot.save(b"old image").unwrap();
        slot.save(b"new image").unwrap();

        assert_eq!(FileSnapshot::new(&path).load().unwrap().unwrap(), b"new image");
        assert!(!dir.path().join("SNAPSHOT.tmp").exists());
    }
}
