//! Book persistence
//!
//! Public `Database` methods are the user-facing write path (origin
//! `Local`). The `*_tx` helpers operate on an open transaction and are
//! shared with the sync coordinator's merge.

use super::models::*;
use super::sort_key::author_sort_key;
use super::{escape_like_pattern, Database, DbError, DbResult, MAX_PAGE_SIZE};
use rusqlite::{params, Connection, OptionalExtension};

const BOOK_SELECT: &str = r#"
    SELECT b.id, b.remote_id, b.title, b.subtitle, b.author_sort, b.isbn13,
           b.google_books_id, b.page_count, b.read_state, b.current_page,
           b.started_at, b.finished_at, b.notes, b.created_at, b.updated_at,
           p.error_message
    FROM books b
    LEFT JOIN sync_pending_changes p ON p.local_id = b.id AND p.status = 'conflict'
"#;

// ============================================================================
// Row Mapping
// ============================================================================

fn book_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
    let read_state: String = row.get(8)?;
    let read_state = ReadState::from_str(&read_state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("invalid read state '{}'", read_state).into(),
        )
    })?;

    Ok(Book {
        id: row.get(0)?,
        remote_id: row.get(1)?,
        fields: BookFields {
            title: row.get(2)?,
            subtitle: row.get(3)?,
            authors: Vec::new(),
            isbn13: row.get(5)?,
            google_books_id: row.get(6)?,
            page_count: row.get(7)?,
            read_state,
            current_page: row.get(9)?,
            started_at: parse_optional_timestamp(10, row.get(10)?)?,
            finished_at: parse_optional_timestamp(11, row.get(11)?)?,
            notes: row.get(12)?,
        },
        author_sort: row.get(4)?,
        created_at: parse_timestamp(13, &row.get::<_, String>(13)?)?,
        updated_at: parse_timestamp(14, &row.get::<_, String>(14)?)?,
        sync_conflict: row.get(15)?,
    })
}

fn load_authors(conn: &Connection, book_id: &LocalId) -> rusqlite::Result<Vec<Author>> {
    let mut stmt = conn.prepare(
        "SELECT first_names, last_name FROM authors WHERE book_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map([book_id], |row| {
        Ok(Author {
            first_names: row.get(0)?,
            last_name: row.get(1)?,
        })
    })?;
    rows.collect()
}

fn with_authors(conn: &Connection, mut book: Book) -> rusqlite::Result<Book> {
    book.fields.authors = load_authors(conn, &book.id)?;
    Ok(book)
}

fn write_authors(conn: &Connection, book_id: &LocalId, authors: &[Author]) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM authors WHERE book_id = ?1", [book_id])?;
    let mut stmt = conn.prepare(
        "INSERT INTO authors (id, book_id, position, first_names, last_name) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (position, author) in authors.iter().enumerate() {
        stmt.execute(params![
            uuid::Uuid::new_v4().to_string(),
            book_id,
            position as i64,
            author.first_names,
            author.last_name,
        ])?;
    }
    Ok(())
}

fn map_constraint(e: rusqlite::Error, what: &str) -> DbError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            DbError::Constraint(format!("{}: {}", what, e))
        }
        other => DbError::Sqlite(other),
    }
}

pub(crate) fn book_change(book: &Book) -> RecordChange {
    RecordChange {
        kind: RecordKind::Book,
        id: book.id.clone(),
        remote_id: book.remote_id.clone(),
        snapshot: Some(RecordSnapshot::Book(book.fields.clone())),
    }
}

// ============================================================================
// Transaction Helpers
// ============================================================================

pub(crate) fn load_book(conn: &Connection, id: &LocalId) -> DbResult<Option<Book>> {
    let book = conn
        .query_row(&format!("{} WHERE b.id = ?1", BOOK_SELECT), [id], book_from_row)
        .optional()?;
    Ok(book.map(|b| with_authors(conn, b)).transpose()?)
}

pub(crate) fn find_book_by_remote_tx(conn: &Connection, remote_id: &RemoteId) -> DbResult<Option<Book>> {
    let book = conn
        .query_row(&format!("{} WHERE b.remote_id = ?1", BOOK_SELECT), [remote_id], book_from_row)
        .optional()?;
    Ok(book.map(|b| with_authors(conn, b)).transpose()?)
}

/// True when another book already uses `google_books_id`
pub(crate) fn google_books_id_taken(
    conn: &Connection,
    google_books_id: &str,
    except: Option<&LocalId>,
) -> DbResult<bool> {
    let taken = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM books WHERE google_books_id = ?1 AND id IS NOT ?2)",
        params![google_books_id, except],
        |row| row.get(0),
    )?;
    Ok(taken)
}

/// Insert a fully formed book row and its authors
pub(crate) fn insert_book_tx(conn: &Connection, book: &Book) -> DbResult<()> {
    conn.execute(
        r#"
        INSERT INTO books (
            id, remote_id, title, subtitle, author_sort, isbn13, google_books_id,
            page_count, read_state, current_page, started_at, finished_at, notes,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
        params![
            book.id,
            book.remote_id,
            book.fields.title,
            book.fields.subtitle,
            book.author_sort,
            book.fields.isbn13,
            book.fields.google_books_id,
            book.fields.page_count,
            book.fields.read_state.as_str(),
            book.fields.current_page,
            book.fields.started_at.as_ref().map(format_timestamp),
            book.fields.finished_at.as_ref().map(format_timestamp),
            book.fields.notes,
            format_timestamp(&book.created_at),
            format_timestamp(&book.updated_at),
        ],
    )
    .map_err(|e| map_constraint(e, "insert book"))?;

    write_authors(conn, &book.id, &book.fields.authors)?;
    Ok(())
}

/// Replace a book's fields; returns the stored book
pub(crate) fn update_book_tx(
    conn: &Connection,
    id: &LocalId,
    fields: BookFields,
    updated_at: chrono::DateTime<chrono::Utc>,
) -> DbResult<Book> {
    let fields = fields.normalized();
    let author_sort = author_sort_key(&fields.authors);

    let changed = conn
        .execute(
            r#"
            UPDATE books
            SET title = ?2, subtitle = ?3, author_sort = ?4, isbn13 = ?5,
                google_books_id = ?6, page_count = ?7, read_state = ?8,
                current_page = ?9, started_at = ?10, finished_at = ?11,
                notes = ?12, updated_at = ?13
            WHERE id = ?1
            "#,
            params![
                id,
                fields.title,
                fields.subtitle,
                author_sort,
                fields.isbn13,
                fields.google_books_id,
                fields.page_count,
                fields.read_state.as_str(),
                fields.current_page,
                fields.started_at.as_ref().map(format_timestamp),
                fields.finished_at.as_ref().map(format_timestamp),
                fields.notes,
                format_timestamp(&updated_at),
            ],
        )
        .map_err(|e| map_constraint(e, "update book"))?;

    if changed == 0 {
        return Err(DbError::NotFound(format!("book {}", id)));
    }

    write_authors(conn, id, &fields.authors)?;

    load_book(conn, id)?.ok_or_else(|| DbError::NotFound(format!("book {}", id)))
}

/// Delete a book, recording the book and any lists that lost it in `event`.
/// Returns `false` if the book did not exist.
pub(crate) fn delete_book_tx(conn: &Connection, id: &LocalId, event: &mut CommitEvent) -> DbResult<bool> {
    let Some(book) = load_book(conn, id)? else {
        return Ok(false);
    };

    let affected_lists: Vec<LocalId> = {
        let mut stmt = conn.prepare("SELECT DISTINCT list_id FROM book_list_items WHERE book_id = ?1")?;
        let rows = stmt.query_map([id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    conn.execute("DELETE FROM books WHERE id = ?1", [id])?;

    event.deleted.push(RecordChange {
        kind: RecordKind::Book,
        id: book.id,
        remote_id: book.remote_id,
        snapshot: None,
    });

    let touched = format_timestamp(&event.committed_at);
    for list_id in affected_lists {
        conn.execute(
            "UPDATE book_lists SET updated_at = ?2 WHERE id = ?1",
            params![list_id, touched],
        )?;
        if let Some(list) = super::lists::load_list(conn, &list_id)? {
            event.updated.push(super::lists::list_change(&list));
        }
    }

    Ok(true)
}

/// Assign a remote identity. Identities are assigned at most once;
/// returns `false` if the book no longer exists.
pub(crate) fn set_book_remote_id(conn: &Connection, id: &LocalId, remote_id: &RemoteId) -> DbResult<bool> {
    let existing: Option<Option<RemoteId>> = conn
        .query_row("SELECT remote_id FROM books WHERE id = ?1", [id], |row| row.get(0))
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
                "UPDATE books SET remote_id = ?2 WHERE id = ?1",
                params![id, remote_id],
            )
            .map_err(|e| map_constraint(e, "assign remote id"))?;
            Ok(true)
        }
    }
}

pub(crate) fn clear_book_remote_ids(conn: &Connection) -> DbResult<usize> {
    Ok(conn.execute("UPDATE books SET remote_id = NULL WHERE remote_id IS NOT NULL", [])?)
}

// ============================================================================
// Public API
// ============================================================================

impl Database {
    /// Add a book
    pub fn create_book(&self, fields: BookFields) -> DbResult<Book> {
        let fields = fields.normalized();
        if fields.title.trim().is_empty() {
            return Err(DbError::Constraint("book title must not be empty".to_string()));
        }

        self.write(ChangeOrigin::Local, |tx, event| {
            if let Some(gid) = &fields.google_books_id {
                if google_books_id_taken(tx, gid, None)? {
                    return Err(DbError::Constraint(format!("google books id {} already in use", gid)));
                }
            }

            let now = event.committed_at;
            let book = Book {
                id: LocalId::new(),
                remote_id: None,
                author_sort: author_sort_key(&fields.authors),
                fields,
                created_at: now,
                updated_at: now,
                sync_conflict: None,
            };
            insert_book_tx(tx, &book)?;
            event.inserted.push(book_change(&book));

            log::debug!("Created book {} ({})", book.id, book.fields.title);
            Ok(book)
        })
    }

    /// Replace the fields of an existing book
    pub fn update_book(&self, id: &LocalId, fields: BookFields) -> DbResult<Book> {
        if fields.title.trim().is_empty() {
            return Err(DbError::Constraint("book title must not be empty".to_string()));
        }

        self.write(ChangeOrigin::Local, |tx, event| {
            if let Some(gid) = &fields.google_books_id {
                if google_books_id_taken(tx, gid, Some(id))? {
                    return Err(DbError::Constraint(format!("google books id {} already in use", gid)));
                }
            }

            let book = update_book_tx(tx, id, fields, event.committed_at)?;
            event.updated.push(book_change(&book));
            Ok(book)
        })
    }

    /// Delete a book
    pub fn delete_book(&self, id: &LocalId) -> DbResult<()> {
        self.write(ChangeOrigin::Local, |tx, event| {
            if delete_book_tx(tx, id, event)? {
                Ok(())
            } else {
                Err(DbError::NotFound(format!("book {}", id)))
            }
        })
    }

    /// Get a book by local identity
    pub fn get_book(&self, id: &LocalId) -> DbResult<Option<Book>> {
        let conn = self.get_conn()?;
        load_book(&conn, id)
    }

    /// Get a book by remote identity
    pub fn find_book_by_remote_id(&self, remote_id: &RemoteId) -> DbResult<Option<Book>> {
        let conn = self.get_conn()?;
        find_book_by_remote_tx(&conn, remote_id)
    }

    /// All books in author order
    pub fn all_books(&self) -> DbResult<Vec<Book>> {
        self.query_books(&BookQuery::default())
    }

    /// Query books by predicate
    pub fn query_books(&self, query: &BookQuery) -> DbResult<Vec<Book>> {
        let conn = self.get_conn()?;

        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(state) = query.read_state {
            values.push(state.as_str().to_string());
            clauses.push("b.read_state = ?");
        }

        if let Some(search) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            values.push(format!("%{}%", escape_like_pattern(search)));
            values.push(format!("%{}%", escape_like_pattern(&super::sort_key::fold(search))));
            clauses.push(
                "(b.title LIKE ? ESCAPE '\\' OR b.subtitle LIKE ?1 ESCAPE '\\' OR b.author_sort LIKE ? ESCAPE '\\')",
            );
        }

        let mut sql = String::from(BOOK_SELECT);
        if !clauses.is_empty() {
            // Number the placeholders in order of appearance
            let mut index = 0;
            let numbered: Vec<String> = clauses
                .iter()
                .map(|clause| number_placeholders(clause, &mut index))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&numbered.join(" AND "));
        }

        sql.push_str(match query.order {
            BookOrder::AuthorSort => " ORDER BY b.author_sort, b.title COLLATE NOCASE, b.id",
            BookOrder::Title => " ORDER BY b.title COLLATE NOCASE, b.id",
            BookOrder::RecentlyUpdated => " ORDER BY b.updated_at DESC, b.id",
        });

        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit.min(MAX_PAGE_SIZE)));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), book_from_row)?;
        let books = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        books
            .into_iter()
            .map(|b| with_authors(&conn, b).map_err(DbError::from))
            .collect()
    }
}

/// Rewrite `?` / `?1` placeholders of one clause to absolute positions.
/// A bare `?` takes the next position; `?1` repeats the clause's first one.
fn number_placeholders(clause: &str, index: &mut usize) -> String {
    let first = *index + 1;
    let mut out = String::with_capacity(clause.len() + 8);
    let mut chars = clause.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '?' {
            if chars.peek() == Some(&'1') {
                chars.next();
                out.push_str(&format!("?{}", first));
            } else {
                *index += 1;
                out.push_str(&format!("?{}", *index));
            }
        } else {
            out.push(c);
        }
    }
    out
}
