//! Pending Change Queue - durable outbound changes awaiting upload
//!
//! One entry per local identity. Later commits coalesce over earlier ones
//! so a push never carries redundant or contradictory operations:
//! - insert + update  -> insert with the latest payload
//! - insert + delete  -> entry removed (never reached the remote)
//! - update + update  -> update with the latest payload
//! - any    + delete  -> delete
//!
//! Every coalesced change bumps the entry's revision. A push only clears
//! an entry whose revision is unchanged since the batch was taken.

use super::models::{
    ChangeKind, LocalId, PendingChange, PendingStatus, RecordKind, RemoteId, Resolution,
    CHANGE_TOKEN_KEY,
};
use crate::db::models::parse_timestamp;
use crate::db::{
    self, format_timestamp, ChangeOrigin, CommitEvent, Database, DbError, RecordChange,
    RecordSnapshot,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const PENDING_SELECT: &str = r#"
    SELECT local_id, record_kind, change_kind, remote_id, payload, revision,
           status, error_message, created_at, updated_at
    FROM sync_pending_changes
"#;

// ============================================================================
// Data Types
// ============================================================================

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: i64,
    pub conflict_count: i64,
    pub insert_count: i64,
    pub update_count: i64,
    pub delete_count: i64,
    pub total_count: i64,
}

fn pending_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingChange> {
    let conversion = |idx: usize, value: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value {:?}", value).into(),
        )
    };

    let record_kind: String = row.get(1)?;
    let change_kind: String = row.get(2)?;
    let status: String = row.get(6)?;
    let payload: Option<String> = row.get(4)?;

    let payload = payload
        .map(|json| serde_json::from_str::<RecordSnapshot>(&json))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(PendingChange {
        local_id: row.get(0)?,
        record_kind: RecordKind::from_str(&record_kind).ok_or_else(|| conversion(1, &record_kind))?,
        change_kind: ChangeKind::from_str(&change_kind).ok_or_else(|| conversion(2, &change_kind))?,
        remote_id: row.get(3)?,
        payload,
        revision: row.get(5)?,
        status: PendingStatus::from_str(&status).ok_or_else(|| conversion(6, &status))?,
        error_message: row.get(7)?,
        created_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
        updated_at: parse_timestamp(9, &row.get::<_, String>(9)?)?,
    })
}

fn encode_payload(snapshot: Option<&RecordSnapshot>) -> Result<Option<String>, QueueError> {
    snapshot
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| QueueError::Serialization(e.to_string()))
}

// ============================================================================
// Transaction Helpers
// ============================================================================

pub(crate) fn pending_for(conn: &Connection, local_id: &LocalId) -> Result<Option<PendingChange>, QueueError> {
    Ok(conn
        .query_row(&format!("{} WHERE local_id = ?1", PENDING_SELECT), [local_id], pending_from_row)
        .optional()?)
}

pub(crate) fn pending_by_remote(conn: &Connection, remote_id: &RemoteId) -> Result<Option<PendingChange>, QueueError> {
    Ok(conn
        .query_row(&format!("{} WHERE remote_id = ?1", PENDING_SELECT), [remote_id], pending_from_row)
        .optional()?)
}

pub(crate) fn remove_pending(conn: &Connection, local_id: &LocalId) -> Result<bool, QueueError> {
    Ok(conn.execute("DELETE FROM sync_pending_changes WHERE local_id = ?1", [local_id])? > 0)
}

/// Coalesce one committed change into the queue
pub(crate) fn coalesce_tx(
    conn: &Connection,
    incoming: ChangeKind,
    change: &RecordChange,
    at: &DateTime<Utc>,
) -> Result<(), QueueError> {
    let now = format_timestamp(at);
    let existing = pending_for(conn, &change.id)?;

    let Some(existing) = existing else {
        let kind = match (incoming, &change.remote_id) {
            (ChangeKind::Delete, None) => return Ok(()),
            (ChangeKind::Delete, Some(_)) => ChangeKind::Delete,
            (_, None) => ChangeKind::Insert,
            (_, Some(_)) => ChangeKind::Update,
        };
        let payload = match kind {
            ChangeKind::Delete => None,
            _ => encode_payload(change.snapshot.as_ref())?,
        };
        conn.execute(
            r#"
            INSERT INTO sync_pending_changes (
                local_id, record_kind, change_kind, remote_id, payload,
                revision, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 1, 'pending', ?6, ?6)
            "#,
            params![
                change.id,
                change.kind.as_str(),
                kind.as_str(),
                change.remote_id,
                payload,
                now,
            ],
        )?;
        return Ok(());
    };

    let remote_id = change.remote_id.as_ref().or(existing.remote_id.as_ref());
    let (kind, payload) = match (existing.change_kind, incoming) {
        (ChangeKind::Delete, _) => return Ok(()),
        (ChangeKind::Insert, ChangeKind::Delete) if remote_id.is_none() => {
            log::debug!("Dropping never-synced {} {}", change.kind.as_str(), change.id);
            remove_pending(conn, &change.id)?;
            return Ok(());
        }
        (_, ChangeKind::Delete) => (ChangeKind::Delete, None),
        (ChangeKind::Insert, _) => (ChangeKind::Insert, encode_payload(change.snapshot.as_ref())?),
        (ChangeKind::Update, _) => (ChangeKind::Update, encode_payload(change.snapshot.as_ref())?),
    };

    conn.execute(
        r#"
        UPDATE sync_pending_changes
        SET change_kind = ?2, remote_id = ?3, payload = ?4,
            revision = revision + 1, updated_at = ?5
        WHERE local_id = ?1
        "#,
        params![change.id, kind.as_str(), remote_id, payload, now],
    )?;
    Ok(())
}

/// Clear an uploaded entry if nothing changed since `revision`.
///
/// When the entry moved on, the assigned remote identity is kept on it so
/// the newer payload is pushed as an update.
pub(crate) fn complete_tx(
    conn: &Connection,
    local_id: &LocalId,
    revision: i64,
    assigned: Option<&RemoteId>,
) -> Result<bool, QueueError> {
    let removed = conn.execute(
        "DELETE FROM sync_pending_changes WHERE local_id = ?1 AND revision = ?2",
        params![local_id, revision],
    )?;
    if removed > 0 {
        return Ok(true);
    }

    if let Some(remote_id) = assigned {
        conn.execute(
            r#"
            UPDATE sync_pending_changes
            SET remote_id = ?2,
                change_kind = CASE change_kind WHEN 'insert' THEN 'update' ELSE change_kind END
            WHERE local_id = ?1
            "#,
            params![local_id, remote_id],
        )?;
    }
    Ok(false)
}

pub(crate) fn mark_conflict_tx(
    conn: &Connection,
    local_id: &LocalId,
    reason: &str,
    at: &DateTime<Utc>,
) -> Result<bool, QueueError> {
    let changed = conn.execute(
        r#"
        UPDATE sync_pending_changes
        SET status = 'conflict', error_message = ?2, updated_at = ?3
        WHERE local_id = ?1
        "#,
        params![local_id, reason, format_timestamp(at)],
    )?;
    Ok(changed > 0)
}

/// Current snapshot of a record as a change entry, `None` if it is gone
fn current_change(conn: &Connection, kind: RecordKind, id: &LocalId) -> Result<Option<RecordChange>, QueueError> {
    Ok(match kind {
        RecordKind::Book => db::load_book(conn, id)?.map(|b| db::book_change(&b)),
        RecordKind::List => db::load_list(conn, id)?.map(|l| db::list_change(&l)),
    })
}

fn unsynced_ids(conn: &Connection, table: &str) -> Result<Vec<LocalId>, QueueError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE remote_id IS NULL
         AND id NOT IN (SELECT local_id FROM sync_pending_changes)
         ORDER BY created_at, id",
        table
    ))?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<LocalId>>>()?)
}

/// Enqueue an insert for every record that was never uploaded and has no
/// pending entry. Returns the number of entries added.
pub(crate) fn reconcile_tx(conn: &Connection, at: &DateTime<Utc>) -> Result<usize, QueueError> {
    let mut added = 0;
    for (kind, table) in [(RecordKind::Book, "books"), (RecordKind::List, "book_lists")] {
        for id in unsynced_ids(conn, table)? {
            if let Some(change) = current_change(conn, kind, &id)? {
                coalesce_tx(conn, ChangeKind::Insert, &change, at)?;
                added += 1;
            }
        }
    }
    Ok(added)
}

/// Drop every entry and enqueue every local record as a fresh insert.
/// Callers clear remote identities in the same transaction.
pub(crate) fn requeue_everything_tx(conn: &Connection, at: &DateTime<Utc>) -> Result<usize, QueueError> {
    conn.execute("DELETE FROM sync_pending_changes", [])?;
    reconcile_tx(conn, at)
}

// ============================================================================
// Queue Manager
// ============================================================================

/// Durable queue of outbound changes
#[derive(Clone)]
pub struct PendingChangeQueue {
    db: Arc<Database>,
}

impl PendingChangeQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Coalesce every record touched by `event`. Returns the number of
    /// records considered.
    pub fn record(&self, event: &CommitEvent) -> Result<usize, QueueError> {
        if event.is_empty() {
            return Ok(0);
        }

        self.db.write(ChangeOrigin::Local, |tx, _| {
            let at = event.committed_at;
            for change in &event.inserted {
                coalesce_tx(tx, ChangeKind::Insert, change, &at)?;
            }
            for change in &event.updated {
                coalesce_tx(tx, ChangeKind::Update, change, &at)?;
            }
            for change in &event.deleted {
                coalesce_tx(tx, ChangeKind::Delete, change, &at)?;
            }
            Ok(event.len())
        })
    }

    /// Oldest pending (not conflicted) entries, at most `limit`
    pub fn take_batch(&self, limit: usize) -> Result<Vec<PendingChange>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let items = self.db.query(
            &format!(
                "{} WHERE status = 'pending' ORDER BY created_at ASC, local_id ASC LIMIT ?1",
                PENDING_SELECT
            ),
            params![limit],
            pending_from_row,
        )?;

        log::debug!("Took {} pending changes", items.len());
        Ok(items)
    }

    /// Clear an uploaded entry; `false` if it changed since `revision`
    pub fn complete(&self, local_id: &LocalId, revision: i64) -> Result<bool, QueueError> {
        self.db.write(ChangeOrigin::Remote, |tx, _| complete_tx(tx, local_id, revision, None))
    }

    /// Flag an entry as permanently rejected by the remote
    pub fn mark_conflict(&self, local_id: &LocalId, reason: &str) -> Result<(), QueueError> {
        log::warn!("Pending change {} rejected: {}", local_id, reason);
        self.db.write(ChangeOrigin::Remote, |tx, event| {
            if mark_conflict_tx(tx, local_id, reason, &event.committed_at)? {
                Ok(())
            } else {
                Err(QueueError::NotFound(local_id.clone()))
            }
        })
    }

    pub fn get(&self, local_id: &LocalId) -> Result<Option<PendingChange>, QueueError> {
        let conn = self.db.get_conn()?;
        pending_for(&conn, local_id)
    }

    /// Entries awaiting user resolution
    pub fn conflicts(&self) -> Result<Vec<PendingChange>, QueueError> {
        Ok(self.db.query(
            &format!("{} WHERE status = 'conflict' ORDER BY updated_at ASC", PENDING_SELECT),
            [],
            pending_from_row,
        )?)
    }

    /// Resolve a rejected change.
    ///
    /// `Retry` re-queues it unchanged. `DiscardLocal` drops it: a record
    /// that never reached the remote is deleted locally, otherwise the
    /// change token is cleared so the next cycle restores the remote state.
    pub fn resolve_conflict(&self, local_id: &LocalId, resolution: Resolution) -> Result<(), QueueError> {
        log::info!("Resolving conflict on {} with {:?}", local_id, resolution);

        self.db.write(ChangeOrigin::Local, |tx, event| {
            let entry = pending_for(tx, local_id)?.ok_or_else(|| QueueError::NotFound(local_id.clone()))?;
            if entry.status != PendingStatus::Conflict {
                return Err(QueueError::NotInConflict(local_id.clone()));
            }

            match resolution {
                Resolution::Retry => {
                    tx.execute(
                        r#"
                        UPDATE sync_pending_changes
                        SET status = 'pending', error_message = NULL, updated_at = ?2
                        WHERE local_id = ?1
                        "#,
                        params![local_id, format_timestamp(&event.committed_at)],
                    )?;
                }
                Resolution::DiscardLocal => {
                    remove_pending(tx, local_id)?;
                    if entry.change_kind == ChangeKind::Insert && entry.remote_id.is_none() {
                        match entry.record_kind {
                            RecordKind::Book => db::delete_book_tx(tx, local_id, event)?,
                            RecordKind::List => db::delete_list_tx(tx, local_id, event)?,
                        };
                    } else {
                        db::delete_setting_conn(tx, CHANGE_TOKEN_KEY)?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Enqueue records that were committed but never tracked
    pub fn reconcile(&self) -> Result<usize, QueueError> {
        let added = self.db.write::<_, QueueError, _>(ChangeOrigin::Local, |tx, event| {
            reconcile_tx(tx, &event.committed_at)
        })?;
        if added > 0 {
            log::info!("Reconciled {} untracked records into the pending queue", added);
        }
        Ok(added)
    }

    /// Get queue statistics
    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let conn = self.db.get_conn()?;
        let stats = conn.query_row(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'conflict' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN change_kind = 'insert' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN change_kind = 'update' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN change_kind = 'delete' THEN 1 ELSE 0 END), 0),
                COUNT(*)
            FROM sync_pending_changes
            "#,
            [],
            |row| {
                Ok(QueueStats {
                    pending_count: row.get(0)?,
                    conflict_count: row.get(1)?,
                    insert_count: row.get(2)?,
                    update_count: row.get(3)?,
                    delete_count: row.get(4)?,
                    total_count: row.get(5)?,
                })
            },
        )?;
        Ok(stats)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("No pending change for {0}")]
    NotFound(LocalId),

    #[error("Pending change for {0} is not in conflict")]
    NotInConflict(LocalId),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DbError::from(e))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{sample_book, test_db};
    use crate::db::ListFields;

    fn create_test_queue() -> (tempfile::TempDir, Arc<Database>, PendingChangeQueue) {
        let (dir, db) = test_db();
        let queue = PendingChangeQueue::new(db.clone());
        (dir, db, queue)
    }

    /// Track every local commit the way the tracker does
    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<CommitEvent>, queue: &PendingChangeQueue) {
        while let Ok(event) = rx.try_recv() {
            queue.record(&event).unwrap();
        }
    }

    #[test]
    fn test_queue_creation() {
        let (_dir, _db, queue) = create_test_queue();
        let stats = queue.stats().unwrap();
        assert_eq!(stats.total_count, 0);
    }

    #[test]
    fn test_insert_then_updates_coalesce() {
        let (_dir, db, queue) = create_test_queue();
        let mut rx = db.subscribe();

        let book = db.create_book(sample_book("Draft", "Writer")).unwrap();
        let mut fields = book.fields.clone();
        fields.title = "Second".to_string();
        db.update_book(&book.id, fields.clone()).unwrap();
        fields.title = "Final".to_string();
        db.update_book(&book.id, fields).unwrap();
        drain(&mut rx, &queue);

        let stats = queue.stats().unwrap();
        assert_eq!(stats.total_count, 1);

        let entry = queue.get(&book.id).unwrap().unwrap();
        assert_eq!(entry.change_kind, ChangeKind::Insert);
        assert_eq!(entry.revision, 3);
        match entry.payload {
            Some(RecordSnapshot::Book(fields)) => assert_eq!(fields.title, "Final"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_insert_then_delete_removes_entry() {
        let (_dir, db, queue) = create_test_queue();
        let mut rx = db.subscribe();

        let book = db.create_book(sample_book("Gone", "Writer")).unwrap();
        db.delete_book(&book.id).unwrap();
        drain(&mut rx, &queue);

        assert!(queue.get(&book.id).unwrap().is_none());
        assert_eq!(queue.stats().unwrap().total_count, 0);
    }

    #[test]
    fn test_synced_record_update_then_delete() {
        let (_dir, db, queue) = create_test_queue();
        let book = db.create_book(sample_book("Synced", "Writer")).unwrap();
        {
            let conn = db.get_conn().unwrap();
            db::set_book_remote_id(&conn, &book.id, &RemoteId::from("rec-1")).unwrap();
        }

        let mut rx = db.subscribe();
        let mut fields = book.fields.clone();
        fields.notes = Some("annotated".to_string());
        db.update_book(&book.id, fields.clone()).unwrap();
        fields.notes = Some("annotated twice".to_string());
        db.update_book(&book.id, fields).unwrap();
        drain(&mut rx, &queue);

        let entry = queue.get(&book.id).unwrap().unwrap();
        assert_eq!(entry.change_kind, ChangeKind::Update);
        assert_eq!(entry.remote_id, Some(RemoteId::from("rec-1")));
        match entry.payload {
            Some(RecordSnapshot::Book(fields)) => {
                assert_eq!(fields.notes.as_deref(), Some("annotated twice"))
            }
            other => panic!("unexpected payload {:?}", other),
        }

        db.delete_book(&book.id).unwrap();
        drain(&mut rx, &queue);

        let entry = queue.get(&book.id).unwrap().unwrap();
        assert_eq!(entry.change_kind, ChangeKind::Delete);
        assert!(entry.payload.is_none());
        assert_eq!(entry.remote_id, Some(RemoteId::from("rec-1")));
    }

    #[test]
    fn test_delete_of_unsynced_untracked_record_is_ignored() {
        let (_dir, db, queue) = create_test_queue();
        let book = db.create_book(sample_book("Quiet", "Writer")).unwrap();

        let mut rx = db.subscribe();
        db.delete_book(&book.id).unwrap();
        drain(&mut rx, &queue);

        assert_eq!(queue.stats().unwrap().total_count, 0);
    }

    #[test]
    fn test_complete_respects_revision() {
        let (_dir, db, queue) = create_test_queue();
        let mut rx = db.subscribe();

        let book = db.create_book(sample_book("Racing", "Writer")).unwrap();
        drain(&mut rx, &queue);
        let batch = queue.take_batch(10).unwrap();
        assert_eq!(batch.len(), 1);

        // Edited while the upload was in flight
        let mut fields = book.fields.clone();
        fields.title = "Racing Ahead".to_string();
        db.update_book(&book.id, fields).unwrap();
        drain(&mut rx, &queue);

        assert!(!queue.complete(&book.id, batch[0].revision).unwrap());
        assert!(queue.get(&book.id).unwrap().is_some());

        let current = queue.get(&book.id).unwrap().unwrap();
        assert!(queue.complete(&book.id, current.revision).unwrap());
        assert!(queue.get(&book.id).unwrap().is_none());
    }

    #[test]
    fn test_stale_ack_converts_insert_to_update() {
        let (_dir, db, queue) = create_test_queue();
        let mut rx = db.subscribe();

        let book = db.create_book(sample_book("Moving", "Target")).unwrap();
        drain(&mut rx, &queue);
        let taken = queue.take_batch(1).unwrap().remove(0);

        let mut fields = book.fields.clone();
        fields.title = "Moved".to_string();
        db.update_book(&book.id, fields).unwrap();
        drain(&mut rx, &queue);

        let remote = RemoteId::from("rec-9");
        db.write::<_, QueueError, _>(ChangeOrigin::Remote, |tx, _| {
            complete_tx(tx, &book.id, taken.revision, Some(&remote))
        })
        .unwrap();

        let entry = queue.get(&book.id).unwrap().unwrap();
        assert_eq!(entry.change_kind, ChangeKind::Update);
        assert_eq!(entry.remote_id, Some(remote));
    }

    #[test]
    fn test_take_batch_skips_conflicts_and_honours_limit() {
        let (_dir, db, queue) = create_test_queue();
        let mut rx = db.subscribe();

        let first = db.create_book(sample_book("One", "A")).unwrap();
        db.create_book(sample_book("Two", "B")).unwrap();
        db.create_book(sample_book("Three", "C")).unwrap();
        drain(&mut rx, &queue);

        assert_eq!(queue.take_batch(2).unwrap().len(), 2);

        queue.mark_conflict(&first.id, "title rejected").unwrap();
        let batch = queue.take_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|c| c.local_id != first.id));

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending_count, 2);
        assert_eq!(stats.conflict_count, 1);

        let book = db.get_book(&first.id).unwrap().unwrap();
        assert_eq!(book.sync_conflict.as_deref(), Some("title rejected"));
    }

    #[test]
    fn test_resolve_conflict_retry() {
        let (_dir, db, queue) = create_test_queue();
        let mut rx = db.subscribe();

        let book = db.create_book(sample_book("Retry", "Me")).unwrap();
        drain(&mut rx, &queue);

        assert!(matches!(
            queue.resolve_conflict(&book.id, Resolution::Retry),
            Err(QueueError::NotInConflict(_))
        ));

        queue.mark_conflict(&book.id, "rejected").unwrap();
        assert_eq!(queue.conflicts().unwrap().len(), 1);

        queue.resolve_conflict(&book.id, Resolution::Retry).unwrap();
        assert!(queue.conflicts().unwrap().is_empty());
        let entry = queue.get(&book.id).unwrap().unwrap();
        assert_eq!(entry.status, PendingStatus::Pending);
        assert!(entry.error_message.is_none());
    }

    #[test]
    fn test_resolve_conflict_discard_unsynced_deletes_record() {
        let (_dir, db, queue) = create_test_queue();
        let mut rx = db.subscribe();

        let book = db.create_book(sample_book("Rejected", "Forever")).unwrap();
        drain(&mut rx, &queue);
        queue.mark_conflict(&book.id, "invalid").unwrap();

        queue.resolve_conflict(&book.id, Resolution::DiscardLocal).unwrap();
        drain(&mut rx, &queue);

        assert!(db.get_book(&book.id).unwrap().is_none());
        assert_eq!(queue.stats().unwrap().total_count, 0);
    }

    #[test]
    fn test_resolve_conflict_discard_synced_clears_token() {
        let (_dir, db, queue) = create_test_queue();
        let book = db.create_book(sample_book("Known", "Remote")).unwrap();
        {
            let conn = db.get_conn().unwrap();
            db::set_book_remote_id(&conn, &book.id, &RemoteId::from("rec-5")).unwrap();
        }
        db.set_setting(CHANGE_TOKEN_KEY, &"42").unwrap();

        let mut rx = db.subscribe();
        let mut fields = book.fields.clone();
        fields.title = "Edited".to_string();
        db.update_book(&book.id, fields).unwrap();
        drain(&mut rx, &queue);
        queue.mark_conflict(&book.id, "conflict").unwrap();

        queue.resolve_conflict(&book.id, Resolution::DiscardLocal).unwrap();

        assert!(db.get_book(&book.id).unwrap().is_some());
        assert!(queue.get(&book.id).unwrap().is_none());
        let token: Option<String> = db.get_setting(CHANGE_TOKEN_KEY).unwrap();
        assert!(token.is_none());
    }

    #[test]
    fn test_reconcile_enqueues_untracked_records() {
        let (_dir, db, queue) = create_test_queue();

        // Committed without anyone tracking
        let book = db.create_book(sample_book("Lost", "Event")).unwrap();
        let mut list = ListFields::new("Holiday");
        list.books.push(book.id.clone());
        let list = db.create_list(list).unwrap();

        assert_eq!(queue.reconcile().unwrap(), 2);
        assert_eq!(queue.reconcile().unwrap(), 0);

        assert_eq!(queue.get(&book.id).unwrap().unwrap().change_kind, ChangeKind::Insert);
        assert_eq!(queue.get(&list.id).unwrap().unwrap().record_kind, RecordKind::List);
    }

    #[test]
    fn test_book_delete_updates_containing_list_entry() {
        let (_dir, db, queue) = create_test_queue();
        let mut rx = db.subscribe();

        let book = db.create_book(sample_book("Member", "Writer")).unwrap();
        let mut fields = ListFields::new("Shelf");
        fields.books.push(book.id.clone());
        let list = db.create_list(fields).unwrap();
        db.delete_book(&book.id).unwrap();
        drain(&mut rx, &queue);

        let entry = queue.get(&list.id).unwrap().unwrap();
        assert_eq!(entry.change_kind, ChangeKind::Insert);
        match entry.payload {
            Some(RecordSnapshot::List(fields)) => assert!(fields.books.is_empty()),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
