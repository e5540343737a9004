//! Typed records persisted in the local store.
//!
//! Every syncable entity is an explicit struct; there is no dynamic
//! field lookup. Timestamps are kept at microsecond precision so that a
//! value read back from SQLite compares equal to the value written.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identities
// ============================================================================

/// Stable local identity of a record. Never changes for the record's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for LocalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity assigned by the remote record store on first upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RemoteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! sql_string_newtype {
    ($ty:ident) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                String::column_result(value).map($ty)
            }
        }
    };
}

sql_string_newtype!(LocalId);
sql_string_newtype!(RemoteId);

// ============================================================================
// Enumerations
// ============================================================================

/// Kind of syncable record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Book,
    List,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Book => "book",
            Self::List => "list",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "book" => Some(Self::Book),
            "list" => Some(Self::List),
            _ => None,
        }
    }
}

/// Reading progress of a book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadState {
    ToRead,
    Reading,
    Finished,
}

impl ReadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToRead => "to_read",
            Self::Reading => "reading",
            Self::Finished => "finished",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "to_read" => Some(Self::ToRead),
            "reading" => Some(Self::Reading),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }
}

// ============================================================================
// Books
// ============================================================================

/// A book author. Authors are value objects owned by their book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_names: Option<String>,
    pub last_name: String,
}

impl Author {
    pub fn new(first_names: Option<&str>, last_name: &str) -> Self {
        Self {
            first_names: first_names.map(str::to_string),
            last_name: last_name.to_string(),
        }
    }

    /// Placeholder used when a book has no author
    pub fn unknown() -> Self {
        Self::new(None, "Unknown")
    }
}

/// User-editable fields of a book. This is also the synced payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookFields {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn13: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_books_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<i32>,
    pub read_state: ReadState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_page: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl BookFields {
    pub fn new(title: &str, authors: Vec<Author>, read_state: ReadState) -> Self {
        Self {
            title: title.to_string(),
            subtitle: None,
            authors,
            isbn13: None,
            google_books_id: None,
            page_count: None,
            read_state,
            current_page: None,
            started_at: None,
            finished_at: None,
            notes: None,
        }
    }

    /// Apply the invariants every stored book satisfies:
    /// at least one author, and a current page only while reading.
    pub fn normalized(mut self) -> Self {
        if self.authors.is_empty() {
            self.authors.push(Author::unknown());
        }
        if self.read_state != ReadState::Reading {
            self.current_page = None;
        }
        self.started_at = self.started_at.map(normalize_timestamp);
        self.finished_at = self.finished_at.map(normalize_timestamp);
        self
    }
}

/// A persisted book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: LocalId,
    pub remote_id: Option<RemoteId>,
    pub fields: BookFields,
    pub author_sort: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set while an upload of this book is rejected and awaiting resolution
    pub sync_conflict: Option<String>,
}

/// Sort order for book queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookOrder {
    #[default]
    AuthorSort,
    Title,
    RecentlyUpdated,
}

/// Predicate for querying books
#[derive(Debug, Clone, Default)]
pub struct BookQuery {
    pub read_state: Option<ReadState>,
    /// Case-insensitive match on title or subtitle, folded match on authors
    pub search: Option<String>,
    pub order: BookOrder,
    pub limit: Option<u32>,
}

// ============================================================================
// Lists
// ============================================================================

/// User-editable fields of a reading list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFields {
    pub name: String,
    /// Ordered member books
    #[serde(default)]
    pub books: Vec<LocalId>,
}

impl ListFields {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            books: Vec::new(),
        }
    }
}

/// A persisted reading list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookList {
    pub id: LocalId,
    pub remote_id: Option<RemoteId>,
    pub fields: ListFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_conflict: Option<String>,
}

// ============================================================================
// Commit Notifications
// ============================================================================

/// Snapshot of a record's syncable fields at commit time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum RecordSnapshot {
    Book(BookFields),
    List(ListFields),
}

impl RecordSnapshot {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Book(_) => RecordKind::Book,
            Self::List(_) => RecordKind::List,
        }
    }
}

/// Who produced a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// The user, through the presentation layer
    Local,
    /// The sync coordinator merging remote changes
    Remote,
}

/// One record touched by a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordChange {
    pub kind: RecordKind,
    pub id: LocalId,
    pub remote_id: Option<RemoteId>,
    /// Field values after the commit; `None` for deletions
    pub snapshot: Option<RecordSnapshot>,
}

/// Inserted, updated and deleted records of one committed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEvent {
    pub origin: ChangeOrigin,
    pub committed_at: DateTime<Utc>,
    pub inserted: Vec<RecordChange>,
    pub updated: Vec<RecordChange>,
    pub deleted: Vec<RecordChange>,
}

impl CommitEvent {
    pub fn new(origin: ChangeOrigin) -> Self {
        Self {
            origin,
            committed_at: now(),
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

// ============================================================================
// Timestamp Helpers
// ============================================================================

/// Current time at storage precision
pub fn now() -> DateTime<Utc> {
    normalize_timestamp(Utc::now())
}

/// Truncate to the precision stored in SQLite
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn parse_optional_timestamp(
    idx: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(idx, &v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_book_fields() {
        let mut fields = BookFields::new("Dune", vec![], ReadState::Finished);
        fields.current_page = Some(120);

        let fields = fields.normalized();
        assert_eq!(fields.authors, vec![Author::unknown()]);
        assert_eq!(fields.current_page, None);
    }

    #[test]
    fn test_current_page_kept_while_reading() {
        let mut fields = BookFields::new("Dune", vec![Author::new(Some("Frank"), "Herbert")], ReadState::Reading);
        fields.current_page = Some(120);

        assert_eq!(fields.normalized().current_page, Some(120));
    }

    #[test]
    fn test_timestamp_roundtrip_is_exact() {
        let ts = now();
        let parsed = parse_timestamp(0, &format_timestamp(&ts)).unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn test_snapshot_serialization_is_tagged() {
        let snapshot = RecordSnapshot::List(ListFields::new("Holiday"));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["kind"], "list");
        assert_eq!(json["fields"]["name"], "Holiday");
    }
}
