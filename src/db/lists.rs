//! Reading list persistence

use super::models::*;
use super::{Database, DbError, DbResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

const LIST_SELECT: &str = r#"
    SELECT l.id, l.remote_id, l.name, l.created_at, l.updated_at, p.error_message
    FROM book_lists l
    LEFT JOIN sync_pending_changes p ON p.local_id = l.id AND p.status = 'conflict'
"#;

fn list_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BookList> {
    Ok(BookList {
        id: row.get(0)?,
        remote_id: row.get(1)?,
        fields: ListFields {
            name: row.get(2)?,
            books: Vec::new(),
        },
        created_at: parse_timestamp(3, &row.get::<_, String>(3)?)?,
        updated_at: parse_timestamp(4, &row.get::<_, String>(4)?)?,
        sync_conflict: row.get(5)?,
    })
}

fn load_members(conn: &Connection, list_id: &LocalId) -> rusqlite::Result<Vec<LocalId>> {
    let mut stmt =
        conn.prepare("SELECT book_id FROM book_list_items WHERE list_id = ?1 ORDER BY position")?;
    let rows = stmt.query_map([list_id], |row| row.get(0))?;
    rows.collect()
}

fn with_members(conn: &Connection, mut list: BookList) -> rusqlite::Result<BookList> {
    list.fields.books = load_members(conn, &list.id)?;
    Ok(list)
}

/// Drop repeated members, keeping the first position
fn dedup_members(books: Vec<LocalId>) -> Vec<LocalId> {
    let mut seen = std::collections::HashSet::new();
    books.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

fn write_members(conn: &Connection, list_id: &LocalId, books: &[LocalId]) -> DbResult<()> {
    conn.execute("DELETE FROM book_list_items WHERE list_id = ?1", [list_id])?;
    let mut stmt = conn.prepare(
        "INSERT INTO book_list_items (list_id, book_id, position) VALUES (?1, ?2, ?3)",
    )?;
    for (position, book_id) in books.iter().enumerate() {
        stmt.execute(params![list_id, book_id, position as i64])
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    DbError::Constraint(format!("list member {} does not exist", book_id))
                }
                other => DbError::Sqlite(other),
            })?;
    }
    Ok(())
}

pub(crate) fn list_change(list: &BookList) -> RecordChange {
    RecordChange {
        kind: RecordKind::List,
        id: list.id.clone(),
        remote_id: list.remote_id.clone(),
        snapshot: Some(RecordSnapshot::List(list.fields.clone())),
    }
}

pub(crate) fn load_list(conn: &Connection, id: &LocalId) -> DbResult<Option<BookList>> {
    let list = conn
        .query_row(&format!("{} WHERE l.id = ?1", LIST_SELECT), [id], list_from_row)
        .optional()?;
    Ok(list.map(|l| with_members(conn, l)).transpose()?)
}

pub(crate) fn find_list_by_remote_tx(conn: &Connection, remote_id: &RemoteId) -> DbResult<Option<BookList>> {
    let list = conn
        .query_row(&format!("{} WHERE l.remote_id = ?1", LIST_SELECT), [remote_id], list_from_row)
        .optional()?;
    Ok(list.map(|l| with_members(conn, l)).transpose()?)
}

pub(crate) fn insert_list_tx(conn: &Connection, list: &BookList) -> DbResult<()> {
    conn.execute(
        "INSERT INTO book_lists (id, remote_id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            list.id,
            list.remote_id,
            list.fields.name,
            format_timestamp(&list.created_at),
            format_timestamp(&list.updated_at),
        ],
    )?;
    write_members(conn, &list.id, &list.fields.books)
}

pub(crate) fn update_list_tx(
    conn: &Connection,
    id: &LocalId,
    fields: ListFields,
    updated_at: DateTime<Utc>,
) -> DbResult<BookList> {
    let changed = conn.execute(
        "UPDATE book_lists SET name = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, fields.name, format_timestamp(&updated_at)],
    )?;
    if changed == 0 {
        return Err(DbError::NotFound(format!("list {}", id)));
    }

    write_members(conn, id, &dedup_members(fields.books))?;

    load_list(conn, id)?.ok_or_else(|| DbError::NotFound(format!("list {}", id)))
}

/// Returns `false` if the list did not exist
pub(crate) fn delete_list_tx(conn: &Connection, id: &LocalId, event: &mut CommitEvent) -> DbResult<bool> {
    let remote_id: Option<Option<RemoteId>> = conn
        .query_row("SELECT remote_id FROM book_lists WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;

    let Some(remote_id) = remote_id else {
        return Ok(false);
    };

    conn.execute("DELETE FROM book_lists WHERE id = ?1", [id])?;
    event.deleted.push(RecordChange {
        kind: RecordKind::List,
        id: id.clone(),
        remote_id,
        snapshot: None,
    });
    Ok(true)
}

/// Assign a remote identity at most once; `false` if the list is gone
pub(crate) fn set_list_remote_id(conn: &Connection, id: &LocalId, remote_id: &RemoteId) -> DbResult<bool> {
    let existing: Option<Option<RemoteId>> = conn
        .query_row("SELECT remote_id FROM book_lists WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;

    match existing {
        None => Ok(false),
        Some(Some(current)) if current == *remote_id => Ok(true),
        Some(Some(current)) => Err(DbError::RemoteIdentityConflict {
            local_id: id.clone(),
            existing: current,
            attempted: remote_id.clone(),
        }),
        Some(None) => {
            conn.execute(
                "UPDATE book_lists SET remote_id = ?2 WHERE id = ?1",
                params![id, remote_id],
            )?;
            Ok(true)
        }
    }
}

pub(crate) fn clear_list_remote_ids(conn: &Connection) -> DbResult<usize> {
    Ok(conn.execute("UPDATE book_lists SET remote_id = NULL WHERE remote_id IS NOT NULL", [])?)
}

impl Database {
    /// Create a reading list
    pub fn create_list(&self, fields: ListFields) -> DbResult<BookList> {
        if fields.name.trim().is_empty() {
            return Err(DbError::Constraint("list name must not be empty".to_string()));
        }

        self.write(ChangeOrigin::Local, |tx, event| {
            let now = event.committed_at;
            let list = BookList {
                id: LocalId::new(),
                remote_id: None,
                fields: ListFields {
                    name: fields.name,
                    books: dedup_members(fields.books),
                },
                created_at: now,
                updated_at: now,
                sync_conflict: None,
            };
            insert_list_tx(tx, &list)?;
            event.inserted.push(list_change(&list));
            Ok(list)
        })
    }

    /// Rename a list or replace its members
    pub fn update_list(&self, id: &LocalId, fields: ListFields) -> DbResult<BookList> {
        if fields.name.trim().is_empty() {
            return Err(DbError::Constraint("list name must not be empty".to_string()));
        }

        self.write(ChangeOrigin::Local, |tx, event| {
            let list = update_list_tx(tx, id, fields, event.committed_at)?;
            event.updated.push(list_change(&list));
            Ok(list)
        })
    }

    /// Delete a list; member books are kept
    pub fn delete_list(&self, id: &LocalId) -> DbResult<()> {
        self.write(ChangeOrigin::Local, |tx, event| {
            if delete_list_tx(tx, id, event)? {
                Ok(())
            } else {
                Err(DbError::NotFound(format!("list {}", id)))
            }
        })
    }

    pub fn get_list(&self, id: &LocalId) -> DbResult<Option<BookList>> {
        let conn = self.get_conn()?;
        load_list(&conn, id)
    }

    pub fn find_list_by_remote_id(&self, remote_id: &RemoteId) -> DbResult<Option<BookList>> {
        let conn = self.get_conn()?;
        find_list_by_remote_tx(&conn, remote_id)
    }

    /// All lists ordered by name
    pub fn lists(&self) -> DbResult<Vec<BookList>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY l.name COLLATE NOCASE, l.id", LIST_SELECT))?;
        let rows = stmt.query_map([], list_from_row)?;
        let lists = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        lists
            .into_iter()
            .map(|l| with_members(&conn, l).map_err(DbError::from))
            .collect()
    }
}
