//! Sync Module - local-first synchronization with a remote record store
//!
//! The local store is authoritative for the UI. Local commits are tracked
//! into a durable pending-change queue; the coordinator periodically
//! fetches remote changes, merges them, and pushes the queue.
//!
//! Architecture:
//! - Tracker: commit feed -> coalesced pending changes
//! - Coordinator: one cycle at a time, stale results discarded
//! - Worker: schedule, retry backoff, connectivity commands
//! - Remotes: HTTP service, in-memory console, offline stub

pub mod api;
pub mod console;
pub mod coordinator;
pub mod models;
pub mod queue;
pub mod remote;
pub mod tracker;
pub mod worker;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use api::{HttpRemote, HttpSetupError};
pub use console::{ConsoleRemote, OfflineRemote};
pub use coordinator::{SyncCoordinator, SyncError};
pub use models::{
    ChangeKind, ChangeToken, CycleOutcome, CycleReport, OutboundRecord, PendingChange, PendingStatus,
    RecordPayload, RemoteChanges, RemoteListFields, RemoteRecord, Resolution, SyncEvent, SyncState,
    UserId,
};
pub use queue::{PendingChangeQueue, QueueError, QueueStats};
pub use remote::{DeleteResult, RecordKey, RemoteAdapter, RemoteError, UploadResult};
pub use tracker::LocalChangeTracker;
pub use worker::{SyncHandle, SyncWorker, WorkerCommand, WorkerError};
