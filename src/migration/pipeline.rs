//! Migration Pipeline
//!
//! Chains executor steps from the store's detected version to the target,
//! then swaps the final output over the live store with a single rename.
//! Until that rename the live store is never written, so any failure
//! leaves it exactly as it was.

use super::executor::{self, remove_store_files};
use super::lock::StoreLock;
use super::{MigrationError, MigrationOutcome};
use crate::schema::VersionRegistry;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

/// Migrate the store at `store` to the latest built-in version
pub fn migrate(store: &Path) -> Result<MigrationOutcome, MigrationError> {
    let registry = VersionRegistry::builtin();
    MigrationPipeline::new(&registry).migrate(store)
}

pub struct MigrationPipeline<'a> {
    registry: &'a VersionRegistry,
}

impl<'a> MigrationPipeline<'a> {
    pub fn new(registry: &'a VersionRegistry) -> Self {
        Self { registry }
    }

    /// Migrate to the registry's latest version
    pub fn migrate(&self, store: &Path) -> Result<MigrationOutcome, MigrationError> {
        self.migrate_to(store, self.registry.latest().number)
    }

    pub fn migrate_to(&self, store: &Path, target: u32) -> Result<MigrationOutcome, MigrationError> {
        if !store.exists() {
            log::info!("No store at {:?}; it will be created fresh", store);
            return Ok(MigrationOutcome::FreshStore);
        }

        // A current store is returned untouched, before taking the lock
        let from = self.detect(store)?;
        if self.registry.migration_path_to(from, target)?.is_empty() {
            log::debug!("Store already at schema version {}", from);
            return Ok(MigrationOutcome::AlreadyCurrent { version: from });
        }

        let _lock = StoreLock::acquire(store)?;
        remove_stale_temporaries(store);

        fold_write_ahead_log(store)?;

        // Another process may have migrated it before we got the lock
        let from = self.detect(store)?;
        let path = self.registry.migration_path_to(from, target)?;
        if path.is_empty() {
            log::debug!("Store reached schema version {} while waiting for the lock", from);
            return Ok(MigrationOutcome::AlreadyCurrent { version: from });
        }

        log::info!("Migrating store from version {} to {} in {} steps", from, target, path.len());

        let mut current = store.to_path_buf();
        let mut outputs: Vec<PathBuf> = Vec::with_capacity(path.len());
        for step in &path {
            match executor::apply(step, &current) {
                Ok(next) => {
                    outputs.push(next.clone());
                    current = next;
                }
                Err(e) => {
                    discard(&outputs);
                    return Err(e);
                }
            }
        }

        if let Err(source) = fs::rename(&current, store) {
            log::error!("Failed to swap migrated store into place: {}", source);
            discard(&outputs);
            return Err(MigrationError::SwapFailed {
                path: store.to_path_buf(),
                source,
            });
        }

        // The old journal files describe the replaced file
        for suffix in ["-wal", "-shm"] {
            let mut sibling = store.as_os_str().to_owned();
            sibling.push(suffix);
            let _ = fs::remove_file(PathBuf::from(sibling));
        }
        outputs.pop();
        discard(&outputs);

        log::info!("Store migrated to schema version {}", target);
        Ok(MigrationOutcome::Migrated {
            from,
            to: target,
            steps: path.len(),
        })
    }
}

impl MigrationPipeline<'_> {
    fn detect(&self, store: &Path) -> Result<u32, MigrationError> {
        let conn = Connection::open(store)?;
        Ok(self.registry.detect(&conn)?.number)
    }
}

/// Checkpoint any write-ahead log into the main file and leave WAL mode,
/// so the file alone holds the whole store.
fn fold_write_ahead_log(store: &Path) -> Result<(), MigrationError> {
    let mut wal = store.as_os_str().to_owned();
    wal.push("-wal");
    if !Path::new(&wal).exists() {
        return Ok(());
    }

    log::info!("Folding write-ahead log into {:?} before migration", store);
    let conn = Connection::open(store)?;
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
    conn.query_row("PRAGMA journal_mode = DELETE", [], |_| Ok(()))?;
    Ok(())
}

fn discard(outputs: &[PathBuf]) {
    for output in outputs {
        if let Err(e) = remove_store_files(output) {
            log::warn!("Failed to remove migration temporary {:?}: {}", output, e);
        }
    }
}

/// Remove temporaries left behind by an interrupted run
fn remove_stale_temporaries(store: &Path) {
    let dir = match store.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Ok(entries) = fs::read_dir(&dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if executor::is_temp_of(store, &path) {
            log::warn!("Removing stale migration temporary {:?}", path);
            if let Err(e) = remove_store_files(&path) {
                log::warn!("Failed to remove {:?}: {}", path, e);
            }
        }
    }
}
