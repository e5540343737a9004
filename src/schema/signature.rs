//! Structural signatures of SQLite stores
//!
//! A signature is a SHA-256 digest over a canonical, sorted description of
//! every user table, its columns and its indexes. Index and table *names*
//! of automatic indexes are left out so two stores built from the same DDL
//! always agree.

use rusqlite::Connection;
use sha2::{Digest, Sha256};

/// Tables that hold data, excluding SQLite internals
fn user_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

/// Canonical layout lines for the store, sorted
pub fn layout(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut lines = Vec::new();

    for table in user_tables(conn)? {
        lines.push(format!("table {}", table));

        let mut columns = conn.prepare(
            "SELECT name, UPPER(type), \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
        )?;
        let rows = columns.query_map([&table], |row| {
            Ok(format!(
                "column {}.{} {} notnull={} pk={}",
                table,
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for line in rows {
            lines.push(line?);
        }

        let mut indexes = conn.prepare("SELECT name, \"unique\" FROM pragma_index_list(?1)")?;
        let index_rows = indexes.query_map([&table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for index in index_rows {
            let (name, unique) = index?;
            let mut cols = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
            let names = cols
                .query_map([&name], |row| row.get::<_, Option<String>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .map(|c| c.unwrap_or_else(|| "<expr>".to_string()))
                .collect::<Vec<_>>();
            lines.push(format!("index {}({}) unique={}", table, names.join(","), unique));
        }
    }

    lines.sort();
    Ok(lines)
}

/// SHA-256 hex digest of the store layout
pub fn structural_signature(conn: &Connection) -> rusqlite::Result<String> {
    let mut hasher = Sha256::new();
    for line in layout(conn)? {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Signature of the layout a DDL script produces
pub fn signature_of_ddl(ddl: &str) -> rusqlite::Result<String> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(ddl)?;
    structural_signature(&conn)
}

/// True if the store contains no user tables at all
pub fn is_empty_store(conn: &Connection) -> rusqlite::Result<bool> {
    Ok(user_tables(conn)?.is_empty())
}
