//! Temporary storage for instances received during a retrieve session.
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not create storage directory {}", path.display()))]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not list storage directory {}", path.display()))]
    ListDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not delete {}", path.display()))]
    Delete {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not walk storage directory {}", path.display()))]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// File count and total size of a storage area.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StorageStats {
    /// number of regular files
    pub files: u64,
    /// sum of the file sizes in bytes
    pub bytes: u64,
}

/// A directory receiving the instances moved during a retrieve session,
/// emptied before and after the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryStorage {
    path: PathBuf,
}

impl TemporaryStorage {
    /// Use the given directory as temporary storage.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TemporaryStorage { path: path.into() }
    }

    /// The default location:
    /// `dicoms` under the system temporary directory
    /// (`TMPDIR`), or under the user's home directory if that is not set.
    pub fn default_location() -> PathBuf {
        std::env::var_os("TMPDIR")
            .filter(|dir| !dir.is_empty())
            .or_else(|| std::env::var_os("HOME"))
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
            .join("dicoms")
    }

    /// The storage directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the storage directory if it does not exist yet.
    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.path).context(CreateDirectorySnafu { path: &self.path })
    }

    /// Delete everything inside the storage directory,
    /// keeping the directory itself.
    ///
    /// A missing directory is not an error.
    pub fn purge(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context(ListDirectorySnafu { path: &self.path }),
        };

        for entry in entries {
            let entry = entry.context(ListDirectorySnafu { path: &self.path })?;
            let path = entry.path();
            let is_dir = entry
                .file_type()
                .map(|t| t.is_dir())
                .context(ListDirectorySnafu { path: &path })?;
            if is_dir {
                fs::remove_dir_all(&path).context(DeleteSnafu { path: &path })?;
            } else {
                fs::remove_file(&path).context(DeleteSnafu { path: &path })?;
            }
        }
        debug!("Purged {}", self.path.display());
        Ok(())
    }

    /// Count the files in the storage directory and sum their sizes.
    ///
    /// A missing directory is reported as empty.
    pub fn stats(&self) -> Result<StorageStats> {
        if !self.path.exists() {
            return Ok(StorageStats::default());
        }

        let mut stats = StorageStats::default();
        for entry in WalkDir::new(&self.path).min_depth(1) {
            let entry = entry.context(WalkSnafu { path: &self.path })?;
            if entry.file_type().is_file() {
                let metadata = entry
                    .metadata()
                    .context(WalkSnafu { path: entry.path() })?;
                stats.files += 1;
                stats.bytes += metadata.len();
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_then_purge() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TemporaryStorage::new(dir.path().join("dicoms"));
        assert_eq!(storage.stats().unwrap(), StorageStats::default());
        storage.purge().unwrap();

        storage.create().unwrap();
        fs::write(storage.path().join("1.dcm"), [0u8; 100]).unwrap();
        fs::create_dir(storage.path().join("sub")).unwrap();
        fs::write(storage.path().join("sub").join("2.dcm"), [0u8; 28]).unwrap();

        assert_eq!(
            storage.stats().unwrap(),
            StorageStats {
                files: 2,
                bytes: 128
            }
        );

        storage.purge().unwrap();
        assert!(storage.path().is_dir());
        assert_eq!(storage.stats().unwrap().files, 0);
    }
}
