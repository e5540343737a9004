//! Sync Coordinator
//!
//! Drives one sync cycle at a time: identity check, initial or incremental
//! fetch, merge into the local store, token persistence, then push of
//! pending local changes. State changes follow `SyncState::on`.
//!
//! A cycle remembers the cycle counter it started with. Losing
//! connectivity bumps the counter; every later commit of the old cycle is
//! refused, so late network results are discarded instead of merged.

use super::models::*;
use super::queue::{self, PendingChangeQueue, QueueError};
use super::remote::{RecordKey, RemoteAdapter, RemoteError};
use crate::db::{
    self, sort_key::author_sort_key, Book, BookFields, BookList, ChangeOrigin, CommitEvent, Database,
    DbError, ListFields, RecordSnapshot,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const DEFAULT_PUSH_BATCH_SIZE: usize = 100;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Sync cycle abandoned")]
    Abandoned,
}

pub struct SyncCoordinator {
    db: Arc<Database>,
    queue: PendingChangeQueue,
    remote: Arc<dyn RemoteAdapter>,
    state: Mutex<SyncState>,
    cycle: AtomicU64,
    events: broadcast::Sender<SyncEvent>,
    push_batch_size: usize,
}

impl SyncCoordinator {
    pub fn new(db: Arc<Database>, remote: Arc<dyn RemoteAdapter>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queue: PendingChangeQueue::new(db.clone()),
            db,
            remote,
            state: Mutex::new(SyncState::Idle),
            cycle: AtomicU64::new(0),
            events,
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
        }
    }

    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    pub fn queue(&self) -> &PendingChangeQueue {
        &self.queue
    }

    pub fn remote_name(&self) -> &str {
        self.remote.name()
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Observe state changes, merges, conflicts and cycle results
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    // =========================================================================
    // STATE MACHINE
    // =========================================================================

    fn transition(&self, trigger: SyncTrigger) -> Option<SyncState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let from = *state;
        let to = from.on(trigger)?;
        *state = to;
        drop(state);

        log::debug!("Sync state {} -> {}", from.as_str(), to.as_str());
        self.emit(SyncEvent::StateChanged { from, to });
        Some(to)
    }

    /// Transition on behalf of `cycle`; refused once the cycle is stale
    fn advance(&self, cycle: u64, trigger: SyncTrigger) -> Result<SyncState, SyncError> {
        self.ensure_current(cycle)?;
        self.transition(trigger).ok_or(SyncError::Abandoned)
    }

    fn ensure_current(&self, cycle: u64) -> Result<(), SyncError> {
        if self.cycle.load(Ordering::SeqCst) == cycle {
            Ok(())
        } else {
            Err(SyncError::Abandoned)
        }
    }

    /// Abandon any cycle in flight and suspend
    pub fn connectivity_lost(&self) {
        self.cycle.fetch_add(1, Ordering::SeqCst);
        if self.transition(SyncTrigger::ConnectivityLost).is_some() {
            log::info!("Connectivity lost; sync suspended");
        }
    }

    /// Leave `Suspended`; returns `false` if sync was not suspended
    pub fn connectivity_restored(&self) -> bool {
        let resumed = self.transition(SyncTrigger::ConnectivityRestored).is_some();
        if resumed {
            log::info!("Connectivity restored; sync resumes");
        }
        resumed
    }

    // =========================================================================
    // CYCLE
    // =========================================================================

    /// Run one full cycle. Remote failures are reported in the outcome;
    /// local store failures are returned as errors.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, SyncError> {
        self.run(false).await
    }

    /// Run a cycle that fetches every remote record instead of the changes
    /// since the last token. Local records whose remote copy is gone are
    /// deleted.
    pub async fn resync_all(&self) -> Result<CycleOutcome, SyncError> {
        log::info!("Full resync requested");
        self.run(true).await
    }

    async fn run(&self, full: bool) -> Result<CycleOutcome, SyncError> {
        let cycle = self.cycle.load(Ordering::SeqCst);
        let local_store_empty = self.db.count_syncable_records()? == 0;

        let initial = match self.transition(SyncTrigger::BecomeActive { local_store_empty }) {
            Some(state) => state == SyncState::FetchingInitial,
            None => {
                let state = self.state();
                log::debug!("Sync cycle skipped in state {}", state.as_str());
                return Ok(self.finish(CycleOutcome::Skipped { state }));
            }
        };

        log::info!(
            "Starting {} sync cycle against {} remote",
            if initial { "initial" } else if full { "full" } else { "incremental" },
            self.remote.name()
        );

        let outcome = match self.cycle_body(cycle, initial, full).await {
            Ok(report) => {
                log::info!(
                    "Sync cycle completed: {} merged, {} deleted locally, {} uploaded, {} deleted remotely, {} conflicts",
                    report.merged,
                    report.deleted_locally,
                    report.uploaded,
                    report.deleted_remotely,
                    report.conflicts
                );
                CycleOutcome::Completed(report)
            }
            Err(SyncError::Abandoned) => {
                log::info!("Sync cycle abandoned");
                CycleOutcome::Abandoned
            }
            Err(SyncError::Remote(RemoteError::Temporary(reason))) => {
                log::warn!("Sync cycle failed temporarily: {}", reason);
                self.fail(cycle, SyncTrigger::TemporaryError);
                CycleOutcome::TemporaryFailure { reason }
            }
            Err(SyncError::Remote(RemoteError::Permanent { reason, .. })) => {
                log::error!("Sync cycle rejected by remote: {}", reason);
                self.fail(cycle, SyncTrigger::PermanentError);
                CycleOutcome::PermanentFailure { reason }
            }
            Err(e) => {
                log::error!("Sync cycle failed: {}", e);
                self.fail(cycle, SyncTrigger::TemporaryError);
                self.emit(SyncEvent::CycleFinished(CycleOutcome::TemporaryFailure {
                    reason: e.to_string(),
                }));
                return Err(e);
            }
        };

        Ok(self.finish(outcome))
    }

    fn fail(&self, cycle: u64, trigger: SyncTrigger) {
        if self.ensure_current(cycle).is_ok() {
            self.transition(trigger);
        }
    }

    fn finish(&self, outcome: CycleOutcome) -> CycleOutcome {
        self.emit(SyncEvent::CycleFinished(outcome.clone()));
        outcome
    }

    async fn cycle_body(&self, cycle: u64, initial: bool, full: bool) -> Result<CycleReport, SyncError> {
        let mut report = CycleReport {
            initial,
            ..CycleReport::default()
        };

        self.check_identity(cycle).await?;

        // Fetch
        let fetch_all = initial || full;
        let (changed, deleted, token) = if fetch_all {
            (self.remote.fetch_all().await?, Vec::new(), None)
        } else {
            let token: Option<ChangeToken> = self.db.get_setting(CHANGE_TOKEN_KEY)?;
            match self.remote.fetch_changes(token.as_ref()).await {
                Ok(changes) => (changes.changed, changes.deleted, Some(changes.token)),
                Err(e @ RemoteError::Permanent { .. }) => {
                    if token.is_some() {
                        log::warn!("Remote refused change token; next cycle refetches everything");
                        self.db.delete_setting(CHANGE_TOKEN_KEY)?;
                    }
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.advance(cycle, SyncTrigger::FetchSucceeded)?;

        // Merge, then persist the token that covers it
        let merged = self.merge(cycle, changed, deleted, fetch_all)?;
        report.merged = merged.inserted.len() + merged.updated.len();
        report.deleted_locally = merged.deleted.len();
        if !merged.is_empty() {
            self.emit(SyncEvent::StoreChanged(merged));
        }

        if let Some(token) = token {
            self.db.write::<_, SyncError, _>(ChangeOrigin::Remote, |tx, _| {
                self.ensure_current(cycle)?;
                db::set_setting_conn(tx, CHANGE_TOKEN_KEY, &token)?;
                Ok(())
            })?;
        }
        self.advance(cycle, SyncTrigger::MergeDone)?;

        // Push
        self.push(cycle, &mut report).await?;
        self.advance(cycle, SyncTrigger::PushDone)?;

        Ok(report)
    }

    /// Bind the store to the signed-in account. A different account owns
    /// different remote data: drop every remote identity and re-queue all
    /// local records.
    async fn check_identity(&self, cycle: u64) -> Result<(), SyncError> {
        let Some(user) = self.remote.fetch_user_identity().await? else {
            return Err(RemoteError::Temporary("no signed-in remote account".to_string()).into());
        };

        let stored: Option<UserId> = self.db.get_setting(USER_ID_KEY)?;
        match stored {
            Some(previous) if previous == user => Ok(()),
            None => {
                log::info!("Binding store to remote account {}", user);
                self.db.set_setting(USER_ID_KEY, &user)?;
                Ok(())
            }
            Some(previous) => {
                log::warn!(
                    "Remote account changed from {} to {}; re-uploading all local records",
                    previous,
                    user
                );
                let requeued = self.db.write::<_, SyncError, _>(ChangeOrigin::Remote, |tx, event| {
                    self.ensure_current(cycle)?;
                    db::clear_book_remote_ids(tx)?;
                    db::clear_list_remote_ids(tx)?;
                    db::delete_setting_conn(tx, CHANGE_TOKEN_KEY)?;
                    let requeued = queue::requeue_everything_tx(tx, &event.committed_at)?;
                    db::set_setting_conn(tx, USER_ID_KEY, &user)?;
                    Ok(requeued)
                })?;
                log::info!("Re-queued {} records for the new account", requeued);
                Ok(())
            }
        }
    }

    // =========================================================================
    // MERGE
    // =========================================================================

    /// Apply remote changes in one transaction; returns what was committed.
    ///
    /// With `complete`, `changed` is the whole remote store and synced local
    /// records missing from it are treated as remote deletions.
    fn merge(
        &self,
        cycle: u64,
        mut changed: Vec<RemoteRecord>,
        mut deleted: Vec<RemoteId>,
        complete: bool,
    ) -> Result<CommitEvent, SyncError> {
        // Lists reference books by remote id
        changed.sort_by_key(|r| match r.kind() {
            RecordKind::Book => 0,
            RecordKind::List => 1,
        });

        self.db.write::<_, SyncError, _>(ChangeOrigin::Remote, |tx, event| {
            if complete {
                let live: HashSet<&RemoteId> = changed.iter().map(|r| &r.remote_id).collect();
                for remote_id in synced_remote_ids(tx)? {
                    if !live.contains(&remote_id) {
                        deleted.push(remote_id);
                    }
                }
            }

            for record in &changed {
                match &record.payload {
                    RecordPayload::Book(fields) => merge_book(tx, event, record, fields)?,
                    RecordPayload::List(fields) => merge_list(tx, event, record, fields)?,
                }
            }
            for remote_id in &deleted {
                merge_deletion(tx, event, remote_id)?;
            }

            self.ensure_current(cycle)?;
            Ok(event.clone())
        })
    }

    // =========================================================================
    // PUSH
    // =========================================================================

    async fn push(&self, cycle: u64, report: &mut CycleReport) -> Result<(), SyncError> {
        let batch = self.queue.take_batch(self.push_batch_size)?;
        if batch.is_empty() {
            return Ok(());
        }
        log::info!("Pushing {} pending changes", batch.len());

        let (deletes, upserts): (Vec<PendingChange>, Vec<PendingChange>) =
            batch.into_iter().partition(|c| c.change_kind == ChangeKind::Delete);
        let (books, lists): (Vec<PendingChange>, Vec<PendingChange>) =
            upserts.into_iter().partition(|c| c.record_kind == RecordKind::Book);

        // Books first so lists can reference their new identities
        self.push_upserts(cycle, books, report).await?;
        self.push_upserts(cycle, lists, report).await?;
        self.push_deletes(cycle, deletes, report).await
    }

    async fn push_upserts(
        &self,
        cycle: u64,
        entries: Vec<PendingChange>,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        if entries.is_empty() {
            return Ok(());
        }

        let outbound = self.prepare_outbound(&entries, report)?;
        if outbound.is_empty() {
            return Ok(());
        }
        self.ensure_current(cycle)?;

        let result = self.remote.upload(&outbound).await;

        let revisions: HashMap<&LocalId, &PendingChange> =
            entries.iter().map(|e| (&e.local_id, e)).collect();
        report.uploaded += self.record_uploads(&revisions, &result.succeeded)?;

        match result.failure {
            None => Ok(()),
            Some(RemoteError::Permanent { affected, reason }) => {
                self.flag_conflicts(&entries, &affected, &reason, report)?;
                Ok(())
            }
            Some(e) => Err(e.into()),
        }
    }

    /// Outbound records for `entries`; lists with members that have no
    /// remote identity yet are deferred.
    fn prepare_outbound(
        &self,
        entries: &[PendingChange],
        report: &mut CycleReport,
    ) -> Result<Vec<OutboundRecord>, SyncError> {
        let conn = self.db.get_conn()?;
        let mut outbound = Vec::with_capacity(entries.len());

        for entry in entries {
            let remote_id = match &entry.remote_id {
                Some(id) => Some(id.clone()),
                None => current_remote_id(&conn, entry.record_kind, &entry.local_id)?,
            };

            let payload = match &entry.payload {
                Some(RecordSnapshot::Book(fields)) => RecordPayload::Book(fields.clone()),
                Some(RecordSnapshot::List(fields)) => {
                    let mut members = HashMap::new();
                    for book in &fields.books {
                        if let Some(remote) = current_remote_id(&conn, RecordKind::Book, book)? {
                            members.insert(book.clone(), remote);
                        }
                    }
                    match list_payload(fields, |id| members.get(id).cloned()) {
                        Ok(remote_fields) => RecordPayload::List(remote_fields),
                        Err(missing) => {
                            log::debug!(
                                "Deferring list {}: {} members not yet uploaded",
                                entry.local_id,
                                missing.len()
                            );
                            report.deferred += 1;
                            continue;
                        }
                    }
                }
                None => {
                    log::warn!("Pending {} of {} has no payload", entry.change_kind.as_str(), entry.local_id);
                    continue;
                }
            };

            outbound.push(OutboundRecord {
                local_id: entry.local_id.clone(),
                remote_id,
                modified_at: entry.updated_at,
                payload,
            });
        }

        Ok(outbound)
    }

    /// Record acknowledged uploads. Runs even for an abandoned cycle: the
    /// remote already holds these records.
    fn record_uploads(
        &self,
        entries: &HashMap<&LocalId, &PendingChange>,
        succeeded: &[(LocalId, RemoteRecord)],
    ) -> Result<usize, SyncError> {
        if succeeded.is_empty() {
            return Ok(0);
        }

        self.db.write::<_, SyncError, _>(ChangeOrigin::Remote, |tx, event| {
            let mut acknowledged = 0;
            for (local_id, record) in succeeded {
                let Some(entry) = entries.get(local_id) else {
                    log::warn!("Remote acknowledged unknown record {}", local_id);
                    continue;
                };

                let assigned = match entry.record_kind {
                    RecordKind::Book => db::set_book_remote_id(tx, local_id, &record.remote_id),
                    RecordKind::List => db::set_list_remote_id(tx, local_id, &record.remote_id),
                };

                match assigned {
                    Ok(true) => {
                        queue::complete_tx(tx, local_id, entry.revision, Some(&record.remote_id))?;
                        acknowledged += 1;
                    }
                    Ok(false) => {
                        // Deleted locally while the upload was in flight
                        let change = db::RecordChange {
                            kind: entry.record_kind,
                            id: local_id.clone(),
                            remote_id: Some(record.remote_id.clone()),
                            snapshot: None,
                        };
                        queue::coalesce_tx(tx, ChangeKind::Delete, &change, &event.committed_at)?;
                        acknowledged += 1;
                    }
                    Err(e @ DbError::RemoteIdentityConflict { .. }) => {
                        log::error!("{}", e);
                        queue::mark_conflict_tx(tx, local_id, &e.to_string(), &event.committed_at)?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(acknowledged)
        })
    }

    async fn push_deletes(
        &self,
        cycle: u64,
        entries: Vec<PendingChange>,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut by_remote: HashMap<RemoteId, &PendingChange> = HashMap::new();
        let mut orphaned = Vec::new();
        for entry in &entries {
            match &entry.remote_id {
                Some(id) => {
                    by_remote.insert(id.clone(), entry);
                }
                None => orphaned.push(entry.local_id.clone()),
            }
        }

        if !orphaned.is_empty() {
            self.db.write::<_, SyncError, _>(ChangeOrigin::Remote, |tx, _| {
                for id in &orphaned {
                    queue::remove_pending(tx, id)?;
                }
                Ok(())
            })?;
        }
        if by_remote.is_empty() {
            return Ok(());
        }
        self.ensure_current(cycle)?;

        let ids: Vec<RemoteId> = entries.iter().filter_map(|e| e.remote_id.clone()).collect();
        let result = self.remote.delete(&ids).await;

        if !result.succeeded.is_empty() {
            report.deleted_remotely += self.db.write::<_, SyncError, _>(ChangeOrigin::Remote, |tx, _| {
                let mut cleared: usize = 0;
                for remote_id in &result.succeeded {
                    if let Some(entry) = by_remote.get(remote_id) {
                        queue::complete_tx(tx, &entry.local_id, entry.revision, None)?;
                        cleared += 1;
                    }
                }
                Ok(cleared)
            })?;
        }

        match result.failure {
            None => Ok(()),
            Some(RemoteError::Permanent { affected, reason }) => {
                self.flag_conflicts(&entries, &affected, &reason, report)?;
                Ok(())
            }
            Some(e) => Err(e.into()),
        }
    }

    /// Flag the batch entries named by a permanent failure
    fn flag_conflicts(
        &self,
        entries: &[PendingChange],
        affected: &[RecordKey],
        reason: &str,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        let flagged: Vec<LocalId> = entries
            .iter()
            .filter(|entry| {
                affected.iter().any(|key| match key {
                    RecordKey::Local(id) => *id == entry.local_id,
                    RecordKey::Remote(id) => entry.remote_id.as_ref() == Some(id),
                })
            })
            .map(|entry| entry.local_id.clone())
            .collect();

        if flagged.is_empty() {
            log::warn!("Remote rejected records outside this batch: {}", reason);
            return Ok(());
        }

        self.db.write::<_, SyncError, _>(ChangeOrigin::Remote, |tx, event| {
            for id in &flagged {
                queue::mark_conflict_tx(tx, id, reason, &event.committed_at)?;
            }
            Ok(())
        })?;

        log::warn!("{} records rejected by remote: {}", flagged.len(), reason);
        report.conflicts += flagged.len();
        self.emit(SyncEvent::ConflictsDetected(flagged));
        Ok(())
    }
}

// ============================================================================
// Merge Helpers
// ============================================================================

fn current_remote_id(conn: &Connection, kind: RecordKind, id: &LocalId) -> Result<Option<RemoteId>, DbError> {
    let sql = match kind {
        RecordKind::Book => "SELECT remote_id FROM books WHERE id = ?1",
        RecordKind::List => "SELECT remote_id FROM book_lists WHERE id = ?1",
    };
    let remote: Option<Option<RemoteId>> = conn.query_row(sql, [id], |row| row.get(0)).optional()?;
    Ok(remote.flatten())
}

/// Remote identities of every synced local record
fn synced_remote_ids(conn: &Connection) -> Result<Vec<RemoteId>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT remote_id FROM books WHERE remote_id IS NOT NULL
         UNION ALL
         SELECT remote_id FROM book_lists WHERE remote_id IS NOT NULL",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<RemoteId>>>()?)
}

/// Last writer wins: the remote write supersedes the local record unless the
/// local copy is strictly newer. When the remote wins, any pending change for
/// the record is dropped.
fn remote_wins(
    conn: &Connection,
    local_id: &LocalId,
    local_updated_at: &DateTime<Utc>,
    remote_modified_at: &DateTime<Utc>,
) -> Result<bool, SyncError> {
    if local_updated_at > remote_modified_at {
        log::debug!("Keeping newer local {} over remote write", local_id);
        return Ok(false);
    }

    if queue::remove_pending(conn, local_id)? {
        log::debug!("Remote write to {} supersedes its pending change", local_id);
    }
    Ok(true)
}

/// A remote record for a local record deleted but not yet pushed
fn locally_deleted(conn: &Connection, record: &RemoteRecord) -> Result<bool, SyncError> {
    let Some(pending) = queue::pending_by_remote(conn, &record.remote_id)? else {
        return Ok(false);
    };
    if pending.change_kind != ChangeKind::Delete {
        return Ok(false);
    }
    if pending.updated_at > record.modified_at {
        return Ok(true);
    }
    // Edited remotely after the local deletion: the record comes back
    queue::remove_pending(conn, &pending.local_id)?;
    Ok(false)
}

fn merge_book(
    conn: &Connection,
    event: &mut CommitEvent,
    record: &RemoteRecord,
    fields: &BookFields,
) -> Result<(), SyncError> {
    let mut fields = fields.clone().normalized();

    match db::find_book_by_remote_tx(conn, &record.remote_id)? {
        None => {
            if locally_deleted(conn, record)? {
                return Ok(());
            }
            if let Some(gid) = &fields.google_books_id {
                if db::google_books_id_taken(conn, gid, None)? {
                    log::warn!("Dropping duplicate Google Books id {} from {}", gid, record.remote_id);
                    fields.google_books_id = None;
                }
            }

            let book = Book {
                id: LocalId::new(),
                remote_id: Some(record.remote_id.clone()),
                author_sort: author_sort_key(&fields.authors),
                fields,
                created_at: event.committed_at,
                updated_at: db::normalize_timestamp(record.modified_at),
                sync_conflict: None,
            };
            db::insert_book_tx(conn, &book)?;
            event.inserted.push(db::book_change(&book));
        }
        Some(book) => {
            if !remote_wins(conn, &book.id, &book.updated_at, &record.modified_at)? {
                return Ok(());
            }
            if let Some(gid) = &fields.google_books_id {
                if db::google_books_id_taken(conn, gid, Some(&book.id))? {
                    log::warn!("Dropping duplicate Google Books id {} from {}", gid, record.remote_id);
                    fields.google_books_id = None;
                }
            }
            if book.fields == fields {
                return Ok(());
            }

            let updated = db::update_book_tx(conn, &book.id, fields, db::normalize_timestamp(record.modified_at))?;
            event.updated.push(db::book_change(&updated));
        }
    }
    Ok(())
}

fn merge_list(
    conn: &Connection,
    event: &mut CommitEvent,
    record: &RemoteRecord,
    fields: &RemoteListFields,
) -> Result<(), SyncError> {
    let mut books = Vec::with_capacity(fields.books.len());
    for remote_book in &fields.books {
        match db::find_book_by_remote_tx(conn, remote_book)? {
            Some(book) => {
                if !books.contains(&book.id) {
                    books.push(book.id);
                }
            }
            None => log::debug!("List {} references unknown book {}", record.remote_id, remote_book),
        }
    }
    let local_fields = ListFields {
        name: fields.name.clone(),
        books,
    };

    match db::find_list_by_remote_tx(conn, &record.remote_id)? {
        None => {
            if locally_deleted(conn, record)? {
                return Ok(());
            }
            let list = BookList {
                id: LocalId::new(),
                remote_id: Some(record.remote_id.clone()),
                fields: local_fields,
                created_at: event.committed_at,
                updated_at: db::normalize_timestamp(record.modified_at),
                sync_conflict: None,
            };
            db::insert_list_tx(conn, &list)?;
            let stored = db::load_list(conn, &list.id)?.unwrap_or(list);
            event.inserted.push(db::list_change(&stored));
        }
        Some(list) => {
            if !remote_wins(conn, &list.id, &list.updated_at, &record.modified_at)? {
                return Ok(());
            }
            if list.fields == local_fields {
                return Ok(());
            }
            let updated = db::update_list_tx(conn, &list.id, local_fields, db::normalize_timestamp(record.modified_at))?;
            event.updated.push(db::list_change(&updated));
        }
    }
    Ok(())
}

/// Remote deletions always win; deleting an unknown record is a no-op
fn merge_deletion(conn: &Connection, event: &mut CommitEvent, remote_id: &RemoteId) -> Result<(), SyncError> {
    if let Some(book) = db::find_book_by_remote_tx(conn, remote_id)? {
        queue::remove_pending(conn, &book.id)?;
        db::delete_book_tx(conn, &book.id, event)?;
    } else if let Some(list) = db::find_list_by_remote_tx(conn, remote_id)? {
        queue::remove_pending(conn, &list.id)?;
        db::delete_list_tx(conn, &list.id, event)?;
    } else if let Some(pending) = queue::pending_by_remote(conn, remote_id)? {
        // Deleted on both sides
        queue::remove_pending(conn, &pending.local_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;
    use crate::sync::console::{ConsoleRemote, OfflineRemote};

    #[tokio::test]
    async fn test_empty_cycle_walks_states() {
        let (_dir, db) = test_db();
        let coordinator = SyncCoordinator::new(db, Arc::new(ConsoleRemote::new()));
        let mut events = coordinator.subscribe();

        let outcome = coordinator.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(ref r) if r.initial));
        assert_eq!(coordinator.state(), SyncState::Idle);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::StateChanged { to, .. } = event {
                states.push(to);
            }
        }
        assert_eq!(
            states,
            vec![
                SyncState::FetchingInitial,
                SyncState::Merging,
                SyncState::PushingLocal,
                SyncState::Idle
            ]
        );
    }

    #[tokio::test]
    async fn test_offline_remote_is_temporary_failure() {
        let (_dir, db) = test_db();
        let coordinator = SyncCoordinator::new(db, Arc::new(OfflineRemote));

        let outcome = coordinator.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::TemporaryFailure { .. }));
        assert_eq!(coordinator.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_suspended_coordinator_skips_cycles() {
        let (_dir, db) = test_db();
        let coordinator = SyncCoordinator::new(db, Arc::new(ConsoleRemote::new()));

        coordinator.connectivity_lost();
        assert_eq!(coordinator.state(), SyncState::Suspended);

        let outcome = coordinator.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Skipped { state: SyncState::Suspended });

        assert!(coordinator.connectivity_restored());
        assert!(!coordinator.connectivity_restored());
        assert!(matches!(coordinator.run_cycle().await.unwrap(), CycleOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_signed_out_is_temporary() {
        let (_dir, db) = test_db();
        let remote = Arc::new(ConsoleRemote::new());
        remote.set_user(None);
        let coordinator = SyncCoordinator::new(db, remote);

        let outcome = coordinator.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::TemporaryFailure { .. }));
    }
}
