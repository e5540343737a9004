//! Integration Tests for Sync Module
//!
//! End-to-end cycles against the console remote:
//! - upload, merge and deletion flows in both directions
//! - last-writer-wins between concurrent edits
//! - partial upload failures, conflicts and their resolution
//! - stale cycles after connectivity loss
//! - account switches and change-token recovery

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::db::test_support::{sample_book, test_db};
    use crate::db::{CommitEvent, Database, ListFields, ReadState};
    use crate::sync::models::{RemoteId, CHANGE_TOKEN_KEY, USER_ID_KEY};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, Notify};

    struct Harness {
        _dir: TempDir,
        db: Arc<Database>,
        remote: Arc<ConsoleRemote>,
        coordinator: SyncCoordinator,
        tracker: LocalChangeTracker,
        commits: mpsc::UnboundedReceiver<CommitEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let (dir, db) = test_db();
            let remote = Arc::new(ConsoleRemote::new());
            let coordinator = SyncCoordinator::new(db.clone(), remote.clone());
            let tracker = LocalChangeTracker::new(coordinator.queue().clone());
            let commits = db.subscribe();
            Self {
                _dir: dir,
                db,
                remote,
                coordinator,
                tracker,
                commits,
            }
        }

        fn track(&mut self) {
            self.tracker.drain(&mut self.commits).unwrap();
        }

        async fn cycle(&mut self) -> CycleOutcome {
            self.track();
            self.coordinator.run_cycle().await.unwrap()
        }

        async fn sync(&mut self) -> CycleReport {
            match self.cycle().await {
                CycleOutcome::Completed(report) => report,
                other => panic!("cycle did not complete: {:?}", other),
            }
        }

        async fn resync(&mut self) -> CycleReport {
            self.track();
            match self.coordinator.resync_all().await.unwrap() {
                CycleOutcome::Completed(report) => report,
                other => panic!("resync did not complete: {:?}", other),
            }
        }
    }

    fn book_payload(title: &str, last_name: &str) -> RecordPayload {
        RecordPayload::Book(sample_book(title, last_name).normalized())
    }

    fn titles(db: &Database) -> Vec<String> {
        let mut titles: Vec<String> = db.all_books().unwrap().into_iter().map(|b| b.fields.title).collect();
        titles.sort();
        titles
    }

    async fn tick() {
        // Keeps successive timestamps strictly ordered
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // ========================================================================
    // Upload
    // ========================================================================

    #[tokio::test]
    async fn test_local_insert_is_uploaded() {
        let mut h = Harness::new();
        let book = h.db.create_book(sample_book("Emma", "Austen")).unwrap();

        let report = h.sync().await;
        assert_eq!(report.uploaded, 1);

        let stored = h.db.get_book(&book.id).unwrap().unwrap();
        let remote_id = stored.remote_id.expect("remote id assigned");
        let remote = h.remote.get(&remote_id).unwrap();
        assert_eq!(remote.payload, RecordPayload::Book(stored.fields));
        assert_eq!(h.coordinator.queue().stats().unwrap().total_count, 0);

        // The echo of our own upload changes nothing
        let report = h.sync().await;
        assert_eq!(report.merged, 0);
        assert_eq!(report.uploaded, 0);
    }

    #[tokio::test]
    async fn test_edits_coalesce_into_one_upload() {
        let mut h = Harness::new();
        let book = h.db.create_book(sample_book("Draft", "Woolf")).unwrap();
        let mut fields = book.fields.clone();
        fields.title = "Second Draft".to_string();
        h.db.update_book(&book.id, fields.clone()).unwrap();
        fields.title = "Mrs Dalloway".to_string();
        h.db.update_book(&book.id, fields).unwrap();
        h.track();

        let pending = h.coordinator.queue().get(&book.id).unwrap().unwrap();
        assert_eq!(pending.change_kind, ChangeKind::Insert);
        match pending.payload {
            Some(crate::db::RecordSnapshot::Book(ref f)) => assert_eq!(f.title, "Mrs Dalloway"),
            ref other => panic!("unexpected payload {:?}", other),
        }

        let report = h.sync().await;
        assert_eq!(report.uploaded, 1);
        assert_eq!(h.remote.records().len(), 1);
        match &h.remote.records()[0].payload {
            RecordPayload::Book(f) => assert_eq!(f.title, "Mrs Dalloway"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_insert_then_delete_never_reaches_remote() {
        let mut h = Harness::new();
        let book = h.db.create_book(sample_book("Ephemeral", "Nobody")).unwrap();
        h.db.delete_book(&book.id).unwrap();

        let report = h.sync().await;
        assert_eq!(report.uploaded, 0);
        assert_eq!(report.deleted_remotely, 0);
        assert!(h.remote.records().is_empty());
    }

    #[tokio::test]
    async fn test_local_delete_is_pushed() {
        let mut h = Harness::new();
        let book = h.db.create_book(sample_book("Beloved", "Morrison")).unwrap();
        h.sync().await;
        let remote_id = h.db.get_book(&book.id).unwrap().unwrap().remote_id.unwrap();

        h.db.delete_book(&book.id).unwrap();
        let report = h.sync().await;

        assert_eq!(report.deleted_remotely, 1);
        assert!(h.remote.get(&remote_id).is_none());
        assert_eq!(h.coordinator.queue().stats().unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn test_list_uploads_after_its_books() {
        let mut h = Harness::new();
        let book = h.db.create_book(sample_book("Ulysses", "Joyce")).unwrap();
        let mut fields = ListFields::new("Modernism");
        fields.books.push(book.id.clone());
        let list = h.db.create_list(fields).unwrap();

        let report = h.sync().await;
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.deferred, 0);

        let book_remote = h.db.get_book(&book.id).unwrap().unwrap().remote_id.unwrap();
        let list_remote = h.db.get_list(&list.id).unwrap().unwrap().remote_id.unwrap();
        match h.remote.get(&list_remote).unwrap().payload {
            RecordPayload::List(remote) => {
                assert_eq!(remote.name, "Modernism");
                assert_eq!(remote.books, vec![book_remote]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    // ========================================================================
    // Merge
    // ========================================================================

    #[tokio::test]
    async fn test_initial_sync_pulls_remote_records() {
        let mut h = Harness::new();
        let remote_book = h.remote.simulate_remote_change(book_payload("Dune", "Herbert"));
        h.remote.simulate_remote_change(RecordPayload::List(RemoteListFields {
            name: "Sci-fi".to_string(),
            books: vec![remote_book.remote_id.clone(), RemoteId::new("rec-unknown")],
        }));

        let report = h.sync().await;
        assert!(report.initial);
        assert_eq!(report.merged, 2);
        assert_eq!(report.uploaded, 0);

        let book = h.db.find_book_by_remote_id(&remote_book.remote_id).unwrap().unwrap();
        assert_eq!(book.fields.title, "Dune");
        assert_eq!(book.author_sort, "herbert");

        let lists = h.db.lists().unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].fields.books, vec![book.id]);

        // Merged records are never echoed back
        h.track();
        assert_eq!(h.coordinator.queue().stats().unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn test_remote_update_and_delete_are_merged() {
        let mut h = Harness::new();
        let a = h.db.create_book(sample_book("Old Title", "Orwell")).unwrap();
        let b = h.db.create_book(sample_book("Animal Farm", "Orwell")).unwrap();
        h.sync().await;
        let a_remote = h.db.get_book(&a.id).unwrap().unwrap().remote_id.unwrap();
        let b_remote = h.db.get_book(&b.id).unwrap().unwrap().remote_id.unwrap();

        h.remote.simulate_remote_update(&a_remote, book_payload("Nineteen Eighty-Four", "Orwell")).unwrap();
        h.remote.simulate_remote_delete(&b_remote);

        let report = h.sync().await;
        assert_eq!(report.merged, 1);
        assert_eq!(report.deleted_locally, 1);
        assert_eq!(h.db.get_book(&a.id).unwrap().unwrap().fields.title, "Nineteen Eighty-Four");
        assert!(h.db.get_book(&b.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_newer_local_edit_wins() {
        let mut h = Harness::new();
        let book = h.db.create_book(sample_book("Base", "Le Guin")).unwrap();
        h.sync().await;
        let remote_id = h.db.get_book(&book.id).unwrap().unwrap().remote_id.unwrap();

        h.remote.simulate_remote_update(&remote_id, book_payload("Remote Edit", "Le Guin")).unwrap();
        tick().await;
        let mut fields = book.fields.clone();
        fields.title = "Local Edit".to_string();
        h.db.update_book(&book.id, fields).unwrap();

        let report = h.sync().await;
        assert_eq!(report.uploaded, 1);
        assert_eq!(h.db.get_book(&book.id).unwrap().unwrap().fields.title, "Local Edit");
        match h.remote.get(&remote_id).unwrap().payload {
            RecordPayload::Book(f) => assert_eq!(f.title, "Local Edit"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_newer_local_edit_wins_before_it_is_queued() {
        let mut h = Harness::new();
        let book = h.db.create_book(sample_book("Base", "Le Guin")).unwrap();
        h.sync().await;
        let remote_id = h.db.get_book(&book.id).unwrap().unwrap().remote_id.unwrap();

        h.remote.simulate_remote_update(&remote_id, book_payload("Remote Edit", "Le Guin")).unwrap();
        tick().await;
        let mut fields = book.fields.clone();
        fields.title = "Local Edit".to_string();
        h.db.update_book(&book.id, fields).unwrap();

        // The commit has not reached the queue yet
        assert!(h.coordinator.queue().get(&book.id).unwrap().is_none());
        match h.coordinator.run_cycle().await.unwrap() {
            CycleOutcome::Completed(report) => assert_eq!(report.uploaded, 0),
            other => panic!("cycle did not complete: {:?}", other),
        }
        assert_eq!(h.db.get_book(&book.id).unwrap().unwrap().fields.title, "Local Edit");

        let report = h.sync().await;
        assert_eq!(report.uploaded, 1);
        match h.remote.get(&remote_id).unwrap().payload {
            RecordPayload::Book(f) => assert_eq!(f.title, "Local Edit"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_newer_remote_edit_wins() {
        let mut h = Harness::new();
        let book = h.db.create_book(sample_book("Base", "Le Guin")).unwrap();
        h.sync().await;
        let remote_id = h.db.get_book(&book.id).unwrap().unwrap().remote_id.unwrap();

        let mut fields = book.fields.clone();
        fields.title = "Local Edit".to_string();
        h.db.update_book(&book.id, fields).unwrap();
        tick().await;
        h.remote.simulate_remote_update(&remote_id, book_payload("Remote Edit", "Le Guin")).unwrap();

        let report = h.sync().await;
        assert_eq!(report.uploaded, 0);
        assert_eq!(h.db.get_book(&book.id).unwrap().unwrap().fields.title, "Remote Edit");
        assert!(h.coordinator.queue().get(&book.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_deletion_beats_local_edit() {
        let mut h = Harness::new();
        let book = h.db.create_book(sample_book("Doomed", "Kafka")).unwrap();
        h.sync().await;
        let remote_id = h.db.get_book(&book.id).unwrap().unwrap().remote_id.unwrap();

        let mut fields = book.fields.clone();
        fields.read_state = ReadState::Reading;
        h.db.update_book(&book.id, fields).unwrap();
        h.remote.simulate_remote_delete(&remote_id);

        let report = h.sync().await;
        assert_eq!(report.deleted_locally, 1);
        assert_eq!(report.uploaded, 0);
        assert!(h.db.get_book(&book.id).unwrap().is_none());
        assert!(h.remote.records().is_empty());
    }

    // ========================================================================
    // Resync and tokens
    // ========================================================================

    #[tokio::test]
    async fn test_resync_all_is_idempotent() {
        let mut h = Harness::new();
        h.remote.simulate_remote_change(book_payload("Remote One", "Calvino"));
        h.db.create_book(sample_book("Local One", "Borges")).unwrap();
        h.sync().await;
        let before = h.db.all_books().unwrap();

        for _ in 0..2 {
            let report = h.resync().await;
            assert_eq!(report.merged, 0);
            assert_eq!(report.deleted_locally, 0);
            assert_eq!(report.uploaded, 0);
        }
        assert_eq!(h.db.all_books().unwrap(), before);
    }

    #[tokio::test]
    async fn test_resync_all_prunes_records_gone_remotely() {
        let mut h = Harness::new();
        let kept = h.db.create_book(sample_book("Kept", "Eco")).unwrap();
        let gone = h.db.create_book(sample_book("Gone", "Eco")).unwrap();
        let unsynced_later = sample_book("Unsynced", "Eco");
        h.sync().await;

        let gone_remote = h.db.get_book(&gone.id).unwrap().unwrap().remote_id.unwrap();
        h.remote.simulate_remote_delete(&gone_remote);
        let unsynced = h.db.create_book(unsynced_later).unwrap();

        let report = h.resync().await;
        assert_eq!(report.deleted_locally, 1);
        assert_eq!(report.uploaded, 1);
        assert!(h.db.get_book(&kept.id).unwrap().is_some());
        assert!(h.db.get_book(&gone.id).unwrap().is_none());
        assert!(h.db.get_book(&unsynced.id).unwrap().unwrap().remote_id.is_some());
    }

    #[tokio::test]
    async fn test_replaying_from_old_token_converges() {
        let mut h = Harness::new();
        h.remote.simulate_remote_change(book_payload("First", "Atwood"));
        // The initial fetch carries no token; the first incremental one does
        h.sync().await;
        h.sync().await;
        let old_token: ChangeToken = h.db.get_setting(CHANGE_TOKEN_KEY).unwrap().unwrap();

        h.remote.simulate_remote_change(book_payload("Second", "Atwood"));
        h.sync().await;
        let converged = titles(&h.db);
        assert_eq!(converged, vec!["First", "Second"]);

        // Crash before the newer token was persisted
        h.db.set_setting(CHANGE_TOKEN_KEY, &old_token).unwrap();
        let report = h.sync().await;
        assert_eq!(report.merged, 0);
        assert_eq!(titles(&h.db), converged);
    }

    #[tokio::test]
    async fn test_rejected_token_falls_back_to_full_fetch() {
        let mut h = Harness::new();
        h.db.create_book(sample_book("Anything", "Sebald")).unwrap();
        h.sync().await;
        h.db.set_setting(CHANGE_TOKEN_KEY, &ChangeToken::new("not-a-sequence")).unwrap();

        match h.cycle().await {
            CycleOutcome::PermanentFailure { .. } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.coordinator.state(), SyncState::Idle);
        let token: Option<ChangeToken> = h.db.get_setting(CHANGE_TOKEN_KEY).unwrap();
        assert!(token.is_none());

        let report = h.sync().await;
        assert_eq!(report.merged, 0);
        assert_eq!(h.db.all_books().unwrap().len(), 1);
    }

    // ========================================================================
    // Failures and conflicts
    // ========================================================================

    #[tokio::test]
    async fn test_partial_upload_failure() {
        let mut h = Harness::new();
        let good = h.db.create_book(sample_book("Accepted", "Mann")).unwrap();
        let bad = h.db.create_book(sample_book("Rejected", "Mann")).unwrap();
        h.remote.reject_local(&bad.id);

        let report = h.sync().await;
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.conflicts, 1);
        assert!(h.db.get_book(&good.id).unwrap().unwrap().remote_id.is_some());
        assert!(h.db.get_book(&bad.id).unwrap().unwrap().remote_id.is_none());

        let conflicts = h.coordinator.queue().conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].local_id, bad.id);
        assert_eq!(conflicts[0].status, PendingStatus::Conflict);
        assert!(h.db.get_book(&bad.id).unwrap().unwrap().sync_conflict.is_some());

        // Conflicts stay put until resolved
        let report = h.sync().await;
        assert_eq!(report.uploaded, 0);
        assert_eq!(h.coordinator.queue().stats().unwrap().conflict_count, 1);

        h.remote.accept_local(&bad.id);
        h.coordinator.queue().resolve_conflict(&bad.id, Resolution::Retry).unwrap();
        let report = h.sync().await;
        assert_eq!(report.uploaded, 1);
        assert!(h.db.get_book(&bad.id).unwrap().unwrap().remote_id.is_some());
        assert_eq!(h.coordinator.queue().stats().unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn test_discarding_unsynced_conflict_deletes_record() {
        let mut h = Harness::new();
        let book = h.db.create_book(sample_book("Unwanted", "Pynchon")).unwrap();
        h.remote.reject_local(&book.id);
        let mut events = h.coordinator.subscribe();

        h.sync().await;
        let mut flagged = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::ConflictsDetected(ids) = event {
                flagged.extend(ids);
            }
        }
        assert_eq!(flagged, vec![book.id.clone()]);

        h.coordinator.queue().resolve_conflict(&book.id, Resolution::DiscardLocal).unwrap();
        assert!(h.db.get_book(&book.id).unwrap().is_none());
        assert_eq!(h.coordinator.queue().stats().unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn test_list_deferred_until_members_uploaded() {
        let mut h = Harness::new();
        let book = h.db.create_book(sample_book("Blocked", "Bolano")).unwrap();
        let mut fields = ListFields::new("Chilean");
        fields.books.push(book.id.clone());
        let list = h.db.create_list(fields).unwrap();
        h.remote.reject_local(&book.id);

        let report = h.sync().await;
        assert_eq!(report.deferred, 1);
        assert!(h.db.get_list(&list.id).unwrap().unwrap().remote_id.is_none());
        let pending = h.coordinator.queue().get(&list.id).unwrap().unwrap();
        assert_eq!(pending.status, PendingStatus::Pending);

        h.remote.accept_local(&book.id);
        h.coordinator.queue().resolve_conflict(&book.id, Resolution::Retry).unwrap();
        let report = h.sync().await;
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.deferred, 0);
        assert!(h.db.get_list(&list.id).unwrap().unwrap().remote_id.is_some());
    }

    #[tokio::test]
    async fn test_offline_cycle_keeps_queue() {
        let mut h = Harness::new();
        h.db.create_book(sample_book("Patient", "Tolstoy")).unwrap();
        h.remote.set_offline(true);

        match h.cycle().await {
            CycleOutcome::TemporaryFailure { .. } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.coordinator.queue().stats().unwrap().pending_count, 1);

        h.remote.set_offline(false);
        let report = h.sync().await;
        assert_eq!(report.uploaded, 1);
    }

    // ========================================================================
    // Account changes
    // ========================================================================

    #[tokio::test]
    async fn test_account_switch_requeues_everything() {
        let mut h = Harness::new();
        let book = h.db.create_book(sample_book("Portable", "Rushdie")).unwrap();
        h.sync().await;
        let first_remote = h.db.get_book(&book.id).unwrap().unwrap().remote_id.unwrap();

        // The new account's store does not hold the old record
        h.remote.simulate_remote_delete(&first_remote);
        h.remote.set_user(Some(UserId::new("second-user")));

        let report = h.sync().await;
        assert_eq!(report.uploaded, 1);
        let second_remote = h.db.get_book(&book.id).unwrap().unwrap().remote_id.unwrap();
        assert_ne!(first_remote, second_remote);

        let user: Option<UserId> = h.db.get_setting(USER_ID_KEY).unwrap();
        assert_eq!(user, Some(UserId::new("second-user")));
    }

    // ========================================================================
    // Stale cycles
    // ========================================================================

    /// Console remote whose fetches wait for the test to release them
    struct GatedRemote {
        inner: ConsoleRemote,
        entered: Notify,
        release: Notify,
    }

    impl GatedRemote {
        async fn gate(&self) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    #[async_trait]
    impl RemoteAdapter for GatedRemote {
        fn name(&self) -> &str {
            "gated"
        }

        async fn fetch_all(&self) -> Result<Vec<RemoteRecord>, RemoteError> {
            self.gate().await;
            self.inner.fetch_all().await
        }

        async fn fetch_changes(&self, since: Option<&ChangeToken>) -> Result<RemoteChanges, RemoteError> {
            self.gate().await;
            self.inner.fetch_changes(since).await
        }

        async fn upload(&self, records: &[OutboundRecord]) -> UploadResult {
            self.inner.upload(records).await
        }

        async fn delete(&self, remote_ids: &[RemoteId]) -> DeleteResult {
            self.inner.delete(remote_ids).await
        }

        async fn fetch_user_identity(&self) -> Result<Option<UserId>, RemoteError> {
            self.inner.fetch_user_identity().await
        }
    }

    #[tokio::test]
    async fn test_stale_cycle_results_are_discarded() {
        let (_dir, db) = test_db();
        let remote = Arc::new(GatedRemote {
            inner: ConsoleRemote::new(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        remote.inner.simulate_remote_change(book_payload("Late", "Calvino"));
        let coordinator = Arc::new(SyncCoordinator::new(db.clone(), remote.clone()));

        let running = coordinator.clone();
        let task = tokio::spawn(async move { running.run_cycle().await });

        remote.entered.notified().await;
        coordinator.connectivity_lost();
        remote.release.notify_one();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, CycleOutcome::Abandoned);
        assert_eq!(coordinator.state(), SyncState::Suspended);
        assert!(db.all_books().unwrap().is_empty());
        let token: Option<ChangeToken> = db.get_setting(CHANGE_TOKEN_KEY).unwrap();
        assert!(token.is_none());

        // A fresh cycle after reconnecting merges normally
        assert!(coordinator.connectivity_restored());
        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run_cycle().await }
        });
        remote.entered.notified().await;
        remote.release.notify_one();
        assert!(matches!(pending.await.unwrap().unwrap(), CycleOutcome::Completed(_)));
        assert_eq!(titles(&db), vec!["Late"]);
    }
}
