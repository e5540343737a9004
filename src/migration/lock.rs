//! Exclusive migration lock beside the store file

use super::MigrationError;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// A lock older than this is assumed to belong to a crashed process
const STALE_AFTER: Duration = Duration::from_secs(300);

/// Held for the whole pipeline run; released on drop
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    /// Lock file used for the store at `store`
    pub fn path_for(store: &Path) -> PathBuf {
        let mut name = store.as_os_str().to_owned();
        name.push(".migration.lock");
        PathBuf::from(name)
    }

    pub fn acquire(store: &Path) -> Result<Self, MigrationError> {
        let path = Self::path_for(store);

        match Self::create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if Self::is_stale(&path)? {
                    log::warn!("Removing stale migration lock {:?}", path);
                    fs::remove_file(&path)?;
                    Self::create(&path).map_err(|e| match e.kind() {
                        io::ErrorKind::AlreadyExists => MigrationError::Locked(path.clone()),
                        _ => MigrationError::Io(e),
                    })
                } else {
                    Err(MigrationError::Locked(path))
                }
            }
            Err(e) => Err(MigrationError::Io(e)),
        }
    }

    fn create(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn is_stale(path: &Path) -> io::Result<bool> {
        let modified = fs::metadata(path)?.modified()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        Ok(age > STALE_AFTER)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to release migration lock {:?}: {}", self.path, e);
            }
        }
    }
}
