//! Row transforms between consecutive schema versions
//!
//! Each function runs inside the destination store's transaction with the
//! source store attached read-only as `src`. Rows are copied with
//! `INSERT ... SELECT` and reshaped by per-column SQL expressions over the
//! source row alias `s`. Transforms that SQL cannot express cleanly are
//! done row by row in Rust.

use crate::db::models::{Author, LocalId};
use crate::db::sort_key::author_sort_key;
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use std::collections::HashSet;

/// Legacy integer read-state codes of versions 8 to 10
const LEGACY_READING: i64 = 1;
const LEGACY_FINISHED: i64 = 3;

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn columns(conn: &Connection, schema: &str, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1, ?2) ORDER BY cid")?;
    let rows = stmt.query_map(params![table, schema], |row| row.get(0))?;
    rows.collect()
}

fn tables(conn: &Connection, schema: &str) -> rusqlite::Result<Vec<String>> {
    let sql = format!(
        "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        quote(schema)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

/// Copy rows of `src.source_table` into `main.dest_table`.
///
/// Destination columns take the expression from `overrides` when listed,
/// otherwise the same-named source column; columns with neither keep their
/// default. Returns the number of rows copied, 0 if the source table does
/// not exist.
pub fn copy_rows(
    conn: &Connection,
    source_table: &str,
    dest_table: &str,
    overrides: &[(&str, &str)],
) -> rusqlite::Result<usize> {
    let source_columns: HashSet<String> = columns(conn, "src", source_table)?.into_iter().collect();
    if source_columns.is_empty() {
        log::debug!("Source table {} absent, nothing to copy", source_table);
        return Ok(0);
    }

    let mut targets = Vec::new();
    let mut expressions = Vec::new();
    for column in columns(conn, "main", dest_table)? {
        let expression = match overrides.iter().find(|(name, _)| *name == column) {
            Some((_, expr)) => expr.to_string(),
            None if source_columns.contains(&column) => format!("s.{}", quote(&column)),
            None => continue,
        };
        targets.push(quote(&column));
        expressions.push(expression);
    }

    let sql = format!(
        "INSERT INTO main.{} ({}) SELECT {} FROM src.{} AS s",
        quote(dest_table),
        targets.join(", "),
        expressions.join(", "),
        quote(source_table)
    );
    let copied = conn.execute(&sql, [])?;
    log::debug!("Copied {} rows {} -> {}", copied, source_table, dest_table);
    Ok(copied)
}

/// Copy every table present under the same name in both stores
pub fn copy_shared_tables(conn: &Connection) -> rusqlite::Result<()> {
    let source: HashSet<String> = tables(conn, "src")?.into_iter().collect();
    for table in tables(conn, "main")? {
        if source.contains(&table) {
            copy_rows(conn, &table, &table, &[])?;
        }
    }
    Ok(())
}

/// Recompute `books.author_sort` from the stored authors
fn recompute_author_sort(conn: &Connection) -> rusqlite::Result<()> {
    let book_ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM main.books")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut authors_stmt = conn.prepare(
        "SELECT first_names, last_name FROM main.authors WHERE book_id = ?1 ORDER BY position",
    )?;
    let mut update = conn.prepare("UPDATE main.books SET author_sort = ?2 WHERE id = ?1")?;

    for id in book_ids {
        let authors = authors_stmt
            .query_map([&id], |row| {
                Ok(Author {
                    first_names: row.get(0)?,
                    last_name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        update.execute(params![id, author_sort_key(&authors)])?;
    }
    Ok(())
}

/// 8 -> 9: every book gets at least one author and a sort key
pub fn v8_to_v9(conn: &Connection) -> rusqlite::Result<()> {
    copy_rows(conn, "settings", "settings", &[])?;
    copy_rows(conn, "books", "books", &[("author_sort", "''")])?;
    copy_rows(conn, "authors", "authors", &[])?;

    let orphans: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM main.books b WHERE NOT EXISTS (SELECT 1 FROM main.authors a WHERE a.book_id = b.id)",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let unknown = Author::unknown();
    for book_id in &orphans {
        conn.execute(
            "INSERT INTO main.authors (id, book_id, position, first_names, last_name) VALUES (?1, ?2, 0, ?3, ?4)",
            params![LocalId::new(), book_id, unknown.first_names, unknown.last_name],
        )?;
    }
    if !orphans.is_empty() {
        log::info!("Added placeholder author to {} books", orphans.len());
    }

    recompute_author_sort(conn)
}

/// 9 -> 10: Google Books ids become unique; the oldest book keeps a shared id
pub fn v9_to_v10(conn: &Connection) -> rusqlite::Result<()> {
    copy_rows(conn, "settings", "settings", &[])?;
    copy_rows(
        conn,
        "books",
        "books",
        &[(
            "google_books_id",
            "CASE WHEN EXISTS (
                SELECT 1 FROM src.books o
                WHERE o.google_books_id = s.google_books_id
                  AND (o.created_at < s.created_at OR (o.created_at = s.created_at AND o.id < s.id))
             ) THEN NULL ELSE s.google_books_id END",
        )],
    )?;
    copy_rows(conn, "authors", "authors", &[])?;
    Ok(())
}

/// 10 -> 11: read state becomes text; current page only survives while reading
pub fn v10_to_v11(conn: &Connection) -> rusqlite::Result<()> {
    let read_state = format!(
        "CASE s.read_state WHEN {} THEN 'reading' WHEN {} THEN 'finished' ELSE 'to_read' END",
        LEGACY_READING, LEGACY_FINISHED
    );
    let current_page = format!(
        "CASE WHEN s.read_state = {} THEN s.current_page ELSE NULL END",
        LEGACY_READING
    );

    copy_rows(conn, "settings", "settings", &[])?;
    copy_rows(
        conn,
        "books",
        "books",
        &[("read_state", read_state.as_str()), ("current_page", current_page.as_str())],
    )?;
    copy_rows(conn, "authors", "authors", &[])?;
    copy_rows(conn, "lists", "lists", &[])?;
    copy_rows(conn, "list_items", "list_items", &[])?;
    Ok(())
}

/// 11 -> 12: list tables renamed; records start without remote identities
pub fn v11_to_v12(conn: &Connection) -> rusqlite::Result<()> {
    copy_rows(conn, "settings", "settings", &[])?;
    copy_rows(conn, "books", "books", &[])?;
    copy_rows(conn, "authors", "authors", &[])?;
    copy_rows(conn, "lists", "book_lists", &[])?;
    copy_rows(conn, "list_items", "book_list_items", &[])?;
    Ok(())
}

/// Parse a legacy ISBN-13 string; anything but plain digits is dropped
pub fn parse_isbn13(value: &str) -> Option<i64> {
    let digits = value.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok().filter(|n| *n > 0)
}

/// 12 -> 13: ISBN-13 becomes an integer
pub fn v12_to_v13(conn: &Connection) -> rusqlite::Result<()> {
    copy_rows(conn, "settings", "settings", &[])?;
    copy_rows(conn, "books", "books", &[("isbn13", "NULL")])?;
    copy_rows(conn, "authors", "authors", &[])?;
    copy_rows(conn, "book_lists", "book_lists", &[])?;
    copy_rows(conn, "book_list_items", "book_list_items", &[])?;
    copy_rows(conn, "sync_pending_changes", "sync_pending_changes", &[])?;

    let legacy: Vec<(String, Value)> = {
        let mut stmt = conn.prepare("SELECT id, isbn13 FROM src.books WHERE isbn13 IS NOT NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut update = conn.prepare("UPDATE main.books SET isbn13 = ?2 WHERE id = ?1")?;
    let mut dropped = 0;
    for (id, value) in legacy {
        let parsed = match value {
            Value::Text(text) => parse_isbn13(&text),
            Value::Integer(n) if n > 0 => Some(n),
            _ => None,
        };
        match parsed {
            Some(isbn) => {
                update.execute(params![id, isbn])?;
            }
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        log::warn!("Dropped {} unparseable ISBN-13 values", dropped);
    }

    reshape_pending_isbn13(conn)
}

/// Queued book snapshots still carry ISBN-13 as text. Rewrite each one to
/// the integer form; a value that does not parse becomes null.
fn reshape_pending_isbn13(conn: &Connection) -> rusqlite::Result<()> {
    let payloads: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT local_id, payload FROM main.sync_pending_changes WHERE payload IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut update = conn.prepare("UPDATE main.sync_pending_changes SET payload = ?2 WHERE local_id = ?1")?;
    let mut rewritten = 0;
    for (local_id, payload) in payloads {
        let Ok(mut snapshot) = serde_json::from_str::<serde_json::Value>(&payload) else {
            log::warn!("Pending change {} has an unreadable payload; clearing it", local_id);
            update.execute(params![local_id, Option::<String>::None])?;
            continue;
        };
        if snapshot.get("kind").and_then(|k| k.as_str()) != Some("book") {
            continue;
        }
        let Some(fields) = snapshot.get_mut("fields").and_then(|f| f.as_object_mut()) else {
            continue;
        };
        let reshaped = match fields.get("isbn13") {
            Some(serde_json::Value::String(text)) => parse_isbn13(text).map(serde_json::Value::from),
            Some(serde_json::Value::Number(n)) => n.as_i64().filter(|n| *n > 0).map(serde_json::Value::from),
            _ => continue,
        };
        fields.insert("isbn13".to_string(), reshaped.unwrap_or(serde_json::Value::Null));

        let json = serde_json::to_string(&snapshot)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        update.execute(params![local_id, json])?;
        rewritten += 1;
    }
    if rewritten > 0 {
        log::debug!("Rewrote ISBN-13 in {} queued book snapshots", rewritten);
    }
    Ok(())
}
