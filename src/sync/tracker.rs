//! Local Change Tracker
//!
//! Consumes the store's ordered commit feed and coalesces every locally
//! originated change into the pending queue. Commits made by the sync
//! coordinator itself (remote origin) are never echoed back.

use super::queue::{PendingChangeQueue, QueueError};
use crate::db::{ChangeOrigin, CommitEvent};
use tokio::sync::mpsc;

pub struct LocalChangeTracker {
    queue: PendingChangeQueue,
}

impl LocalChangeTracker {
    pub fn new(queue: PendingChangeQueue) -> Self {
        Self { queue }
    }

    /// Track one commit. Returns the number of records queued.
    pub fn handle_commit(&self, event: &CommitEvent) -> Result<usize, QueueError> {
        if event.origin != ChangeOrigin::Local {
            return Ok(0);
        }
        let tracked = self.queue.record(event)?;
        log::debug!("Tracked {} local changes", tracked);
        Ok(tracked)
    }

    /// Track every commit already waiting on `rx` without blocking.
    /// Returns the number of commits handled.
    pub fn drain(&self, rx: &mut mpsc::UnboundedReceiver<CommitEvent>) -> Result<usize, QueueError> {
        let mut handled = 0;
        while let Ok(event) = rx.try_recv() {
            self.handle_commit(&event)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Catch up on records committed while nobody was tracking
    pub fn reconcile(&self) -> Result<usize, QueueError> {
        self.queue.reconcile()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{sample_book, test_db};
    use crate::db::{ChangeOrigin, RecordKind};
    use crate::sync::models::ChangeKind;

    #[test]
    fn test_tracks_local_commits_in_order() {
        let (_dir, db) = test_db();
        let queue = PendingChangeQueue::new(db.clone());
        let tracker = LocalChangeTracker::new(queue.clone());
        let mut rx = db.subscribe();

        let book = db.create_book(sample_book("Tracked", "Writer")).unwrap();
        let mut fields = book.fields.clone();
        fields.title = "Tracked Again".to_string();
        db.update_book(&book.id, fields).unwrap();

        assert_eq!(tracker.drain(&mut rx).unwrap(), 2);
        let entry = queue.get(&book.id).unwrap().unwrap();
        assert_eq!(entry.change_kind, ChangeKind::Insert);
        assert_eq!(entry.record_kind, RecordKind::Book);
        assert_eq!(entry.revision, 2);
    }

    #[test]
    fn test_ignores_remote_commits() {
        let (_dir, db) = test_db();
        let queue = PendingChangeQueue::new(db.clone());
        let tracker = LocalChangeTracker::new(queue.clone());

        let book = db.create_book(sample_book("Merged", "Remote")).unwrap();
        let mut event = CommitEvent::new(ChangeOrigin::Remote);
        event.inserted.push(crate::db::book_change(&book));

        assert_eq!(tracker.handle_commit(&event).unwrap(), 0);
        assert!(queue.get(&book.id).unwrap().is_none());
    }
}
