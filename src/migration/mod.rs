//! Store migration
//!
//! Brings an on-disk store from whatever declared version it is at to the
//! latest one. Every step writes a new file; the live store is replaced
//! once, atomically, after the whole chain has succeeded.

pub mod executor;
mod lock;
pub mod mappings;
mod pipeline;

pub use lock::StoreLock;
pub use pipeline::{migrate, MigrationPipeline};

use crate::schema::SchemaError;
use std::path::PathBuf;
use thiserror::Error;

pub type BoxedCause = Box<dyn std::error::Error + Send + Sync>;

/// Migration error types
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Migration step {from} -> {to} failed: {cause}")]
    StepFailed {
        from: u32,
        to: u32,
        #[source]
        cause: BoxedCause,
    },

    #[error("Could not replace store {path:?} with migrated copy: {source}")]
    SwapFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store is locked by another migration ({0:?})")]
    Locked(PathBuf),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a pipeline run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No store existed; it will be created at the latest version
    FreshStore,
    AlreadyCurrent { version: u32 },
    Migrated { from: u32, to: u32, steps: usize },
}
