//! Database module for Reading List
//!
//! Provides the local object store: books, authors, reading lists and the
//! settings key-value table, on top of a pooled SQLite file.
//!
//! All writes go through a single write gate. A commit notification is
//! published to every subscriber while the gate is still held, so the
//! order of notifications always equals the commit order.

mod books;
mod lists;
pub mod models;
pub mod sort_key;

pub use models::*;

use crate::schema::{signature, SchemaError, VersionRegistry};
use rusqlite::{params, Connection, Transaction};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Maximum page size for predicate queries
const MAX_PAGE_SIZE: u32 = 500;

/// Settings key holding the store's schema version number
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Escape LIKE wildcards so user search text is matched literally
fn escape_like_pattern(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Store is at schema version {found}, expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Record {local_id} already has remote identity {existing}, refusing {attempted}")]
    RemoteIdentityConflict {
        local_id: LocalId,
        existing: RemoteId,
        attempted: RemoteId,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
    path: PathBuf,
    write_gate: Arc<Mutex<()>>,
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<CommitEvent>>>>,
}

impl Database {
    /// Open the store at `path`, creating it at the latest schema if new.
    ///
    /// The store must already be at the latest schema version: run the
    /// migration pipeline first.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Self::open_with_registry(path, &VersionRegistry::builtin())
    }

    /// Open the store, checking its layout against `registry`
    pub fn open_with_registry(path: impl AsRef<Path>, registry: &VersionRegistry) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA foreign_keys = ON;
                PRAGMA busy_timeout = 5000;
                "#,
            )
        });

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;

        let latest = registry.latest();
        if signature::is_empty_store(&conn)? {
            log::info!("Creating new store at schema version {}", latest.number);
            conn.execute_batch(latest.ddl)?;
            set_setting_conn(&conn, SCHEMA_VERSION_KEY, &latest.number)?;
        } else {
            let found = registry.detect(&conn)?;
            if found.number != latest.number {
                return Err(DbError::SchemaMismatch {
                    found: found.number,
                    expected: latest.number,
                });
            }
            let recorded: Option<u32> = get_setting_conn(&conn, SCHEMA_VERSION_KEY)?;
            if recorded != Some(latest.number) {
                log::warn!(
                    "Store layout matches version {} but settings record {:?}; correcting",
                    latest.number,
                    recorded
                );
                set_setting_conn(&conn, SCHEMA_VERSION_KEY, &latest.number)?;
            }
        }

        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
            path,
            write_gate: Arc::new(Mutex::new(())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Location of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // COMMITS & NOTIFICATIONS
    // =========================================================================

    /// Subscribe to commit notifications.
    ///
    /// The channel is unbounded and lossless: every commit after this call
    /// is delivered, in commit order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CommitEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Run `f` inside one atomic transaction and publish what it touched.
    pub(crate) fn write<T, E, F>(&self, origin: ChangeOrigin, f: F) -> Result<T, E>
    where
        E: From<DbError>,
        F: FnOnce(&Transaction<'_>, &mut CommitEvent) -> Result<T, E>,
    {
        let _gate = self.write_gate.lock().unwrap_or_else(|e| e.into_inner());

        let mut conn = self.get_conn()?;
        let tx = conn.transaction().map_err(DbError::from)?;
        let mut event = CommitEvent::new(origin);

        let value = f(&tx, &mut event)?;
        tx.commit().map_err(DbError::from)?;

        if !event.is_empty() {
            self.publish(event);
        }

        Ok(value)
    }

    fn publish(&self, event: CommitEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        log::debug!(
            "Commit ({:?}): {} inserted, {} updated, {} deleted",
            event.origin,
            event.inserted.len(),
            event.updated.len(),
            event.deleted.len()
        );
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        get_setting_conn(&conn, key)
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        set_setting_conn(&conn, key, value)
    }

    /// Remove a setting
    pub fn delete_setting(&self, key: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(())
    }

    // =========================================================================
    // HELPER METHODS
    // =========================================================================

    /// Number of books and lists, the records that take part in sync
    pub fn count_syncable_records(&self) -> DbResult<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM books) + (SELECT COUNT(*) FROM book_lists)",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }
}

pub(crate) fn get_setting_conn<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    key: &str,
) -> DbResult<Option<T>> {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM settings WHERE key = ?1",
        [key],
        |row| row.get(0),
    );

    match result {
        Ok(json) => {
            let value: T = serde_json::from_str(&json)
                .map_err(|e| DbError::Serialization(e.to_string()))?;
            Ok(Some(value))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn set_setting_conn<T: Serialize>(conn: &Connection, key: &str, value: &T) -> DbResult<()> {
    let json = serde_json::to_string(value)
        .map_err(|e| DbError::Serialization(e.to_string()))?;

    conn.execute(
        "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
        params![key, json],
    )?;

    Ok(())
}

pub(crate) fn delete_setting_conn(conn: &Connection, key: &str) -> DbResult<()> {
    conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
    Ok(())
}

pub(crate) use books::{
    book_change, clear_book_remote_ids, delete_book_tx, find_book_by_remote_tx,
    google_books_id_taken, insert_book_tx, load_book, set_book_remote_id, update_book_tx,
};
pub(crate) use lists::{
    clear_list_remote_ids, delete_list_tx, find_list_by_remote_tx, insert_list_tx, list_change,
    load_list, set_list_remote_id, update_list_tx,
};
