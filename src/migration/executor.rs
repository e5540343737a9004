//! Migration Step Executor
//!
//! Applies one step: builds a fresh store at the destination version next
//! to the source, copies and reshapes the source rows into it, and checks
//! the result has exactly the destination layout. The source file is only
//! ever opened read-only.

use super::mappings;
use super::{BoxedCause, MigrationError};
use crate::db::SCHEMA_VERSION_KEY;
use crate::schema::{signature, Mapping, MigrationStep};
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

/// Suffix of in-progress migration outputs
pub const TEMP_SUFFIX: &str = ".migrating";

#[derive(Debug, thiserror::Error)]
#[error("migrated store has layout {found}, expected {expected}")]
struct LayoutMismatch {
    found: String,
    expected: String,
}

/// File name of the live store a (possibly chained) temporary belongs to
fn store_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    match name.strip_suffix(TEMP_SUFFIX) {
        Some(stem) => stem.rsplitn(3, '.').last().unwrap_or(stem).to_string(),
        None => name,
    }
}

/// Fresh temporary path for the output of a step, beside the store
pub fn temp_path(source: &Path, destination_version: u32) -> PathBuf {
    source.with_file_name(format!(
        "{}.v{}.{}{}",
        store_name(source),
        destination_version,
        uuid::Uuid::new_v4().simple(),
        TEMP_SUFFIX
    ))
}

/// True if `candidate` is a migration temporary of the store at `store`
pub fn is_temp_of(store: &Path, candidate: &Path) -> bool {
    let Some(name) = candidate.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return false;
    };
    name.ends_with(TEMP_SUFFIX) && name.starts_with(&format!("{}.v", store_name(store)))
}

/// Apply `step` to the store at `source`, returning the new store's location
pub fn apply(step: &MigrationStep, source: &Path) -> Result<PathBuf, MigrationError> {
    let destination = temp_path(source, step.destination);
    log::info!(
        "Migrating store {} -> {} into {:?}",
        step.source,
        step.destination,
        destination.file_name()
    );

    match run(step, source, &destination) {
        Ok(()) => Ok(destination),
        Err(cause) => {
            if let Err(e) = remove_store_files(&destination) {
                log::warn!("Failed to remove partial migration output {:?}: {}", destination, e);
            }
            log::error!("Migration step {} -> {} failed: {}", step.source, step.destination, cause);
            Err(MigrationError::StepFailed {
                from: step.source,
                to: step.destination,
                cause,
            })
        }
    }
}

fn run(step: &MigrationStep, source: &Path, destination: &Path) -> Result<(), BoxedCause> {
    let source_url = Url::from_file_path(fs::canonicalize(source)?)
        .map_err(|_| format!("cannot address {:?} as a file URL", source))?;

    let mut conn = Connection::open(destination)?;
    conn.execute_batch(step.destination_ddl)?;
    conn.execute(
        "ATTACH DATABASE ?1 AS src",
        [format!("{}?mode=ro", source_url)],
    )?;

    let tx = conn.transaction()?;
    match step.mapping {
        Mapping::Inferred => mappings::copy_shared_tables(&tx)?,
        Mapping::Explicit(transform) => transform(&tx)?,
    }
    tx.execute(
        "INSERT OR REPLACE INTO main.settings (key, value) VALUES (?1, ?2)",
        params![SCHEMA_VERSION_KEY, step.destination.to_string()],
    )?;
    tx.commit()?;

    conn.execute("DETACH DATABASE src", [])?;

    let found = signature::structural_signature(&conn)?;
    if found != step.destination_signature {
        return Err(Box::new(LayoutMismatch {
            found,
            expected: step.destination_signature.clone(),
        }));
    }

    conn.close().map_err(|(_, e)| e)?;
    Ok(())
}

/// Remove a store file and its journal siblings, ignoring missing files
pub fn remove_store_files(path: &Path) -> std::io::Result<()> {
    for suffix in ["", "-journal", "-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        match fs::remove_file(PathBuf::from(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
