//! Data directory layout and locking.
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK              # Advisory lock for single-writer
//! ├─ journal.log       # Row journal
//! └─ tillsync.json     # Optional node configuration
//! ```

use crate::config::CONFIG_FILE;
use crate::error::{SyncError, SyncResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tillsync_storage::StorageError;

const LOCK_FILE: &str = "LOCK";
/// Journal file name inside a data directory.
pub const JOURNAL_FILE: &str = "journal.log";
const COMPACT_TEMP: &str = "journal.compact";

/// An opened data directory holding the exclusive lock.
#[derive(Debug)]
pub struct DataDir {
    path: PathBuf,
    _lock_file: File,
}

impl DataDir {
    /// Opens (and optionally creates) a data directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the lock.
    pub fn open(path: &Path, create_if_missing: bool) -> SyncResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(SyncError::Config(format!(
                    "data directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(SyncError::Config(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.display().to_string()).into());
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the journal path.
    pub fn journal_path(&self) -> PathBuf {
        journal_path(&self.path)
    }

    /// Returns the scratch path used while compacting.
    pub fn compact_path(&self) -> PathBuf {
        self.path.join(COMPACT_TEMP)
    }

    /// Returns the node configuration path.
    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    /// Fsyncs the directory so renames inside it are durable.
    pub fn sync_directory(&self) -> SyncResult<()> {
        #[cfg(unix)]
        {
            File::open(&self.path)?.sync_all()?;
        }
        Ok(())
    }
}

/// Returns the journal path inside `dir` without locking it.
pub fn journal_path(dir: &Path) -> PathBuf {
    dir.join(JOURNAL_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_open_is_locked_out() {
        let tmp = tempfile::tempdir().unwrap();
        let first = DataDir::open(tmp.path(), true).unwrap();
        assert!(matches!(
            DataDir::open(tmp.path(), true),
            Err(SyncError::Storage(StorageError::Locked(_)))
        ));
        drop(first);
        assert!(DataDir::open(tmp.path(), true).is_ok());
    }

    #[test]
    fn missing_dir_without_create() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nope");
        assert!(matches!(
            DataDir::open(&path, false),
            Err(SyncError::Config(_))
        ));
        let dir = DataDir::open(&path, true).unwrap();
        assert!(dir.journal_path().ends_with("journal.log"));
    }
}
