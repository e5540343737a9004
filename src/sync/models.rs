//! Sync Data Models
//!
//! Types exchanged between the local change tracker, the coordinator and
//! remote adapters:
//! - RemoteRecord / OutboundRecord: records as the remote store sees them
//! - ChangeToken: opaque remote cursor
//! - PendingChange: queued outbound mutation
//! - SyncState / SyncTrigger: coordinator state machine
//! - SyncEvent: notifications for observers

use crate::db::{BookFields, CommitEvent, ListFields, RecordSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::db::{LocalId, RecordKind, RemoteId};

/// Settings key of the persisted change token
pub const CHANGE_TOKEN_KEY: &str = "sync.change_token";

/// Settings key of the remote account the local store is bound to
pub const USER_ID_KEY: &str = "sync.user_id";

// ============================================================================
// Remote Identities
// ============================================================================

/// Opaque cursor issued by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeToken(String);

impl ChangeToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Remote account identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Remote Records
// ============================================================================

/// Reading list as stored remotely: members by remote identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteListFields {
    pub name: String,
    #[serde(default)]
    pub books: Vec<RemoteId>,
}

/// Field set of a remote record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum RecordPayload {
    Book(BookFields),
    List(RemoteListFields),
}

impl RecordPayload {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Book(_) => RecordKind::Book,
            Self::List(_) => RecordKind::List,
        }
    }
}

/// A record held by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub remote_id: RemoteId,
    /// Time of the write the remote payload reflects
    pub modified_at: DateTime<Utc>,
    pub payload: RecordPayload,
}

impl RemoteRecord {
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }
}

/// A local record being uploaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub local_id: LocalId,
    /// Set when the record already exists remotely
    pub remote_id: Option<RemoteId>,
    pub modified_at: DateTime<Utc>,
    pub payload: RecordPayload,
}

/// Result of an incremental fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChanges {
    pub changed: Vec<RemoteRecord>,
    pub deleted: Vec<RemoteId>,
    pub token: ChangeToken,
}

// ============================================================================
// Pending Changes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Queue entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    /// Rejected permanently by the remote; waits for user resolution
    Conflict,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Conflict => "conflict",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "conflict" => Some(Self::Conflict),
            _ => None,
        }
    }
}

/// A queued, not yet uploaded mutation of one local record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub local_id: LocalId,
    pub record_kind: RecordKind,
    pub change_kind: ChangeKind,
    pub remote_id: Option<RemoteId>,
    /// Field values at the last coalesced commit; `None` for deletions
    pub payload: Option<RecordSnapshot>,
    /// Bumped on every coalesced change
    pub revision: i64,
    pub status: PendingStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a user resolves a rejected change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Try the upload again as is
    Retry,
    /// Drop the local change and take the remote state
    DiscardLocal,
}

// ============================================================================
// Coordinator State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    FetchingInitial,
    FetchingIncremental,
    Merging,
    PushingLocal,
    Suspended,
}

/// Inputs of the coordinator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    BecomeActive { local_store_empty: bool },
    FetchSucceeded,
    MergeDone,
    PushDone,
    TemporaryError,
    PermanentError,
    ConnectivityLost,
    ConnectivityRestored,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::FetchingInitial => "fetching_initial",
            Self::FetchingIncremental => "fetching_incremental",
            Self::Merging => "merging",
            Self::PushingLocal => "pushing_local",
            Self::Suspended => "suspended",
        }
    }

    /// True while a cycle is running
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::FetchingInitial | Self::FetchingIncremental | Self::Merging | Self::PushingLocal
        )
    }

    /// Next state for `trigger`, `None` if the trigger is not valid here
    pub fn on(self, trigger: SyncTrigger) -> Option<SyncState> {
        use SyncState::*;
        use SyncTrigger::*;

        match (self, trigger) {
            (Idle, BecomeActive { local_store_empty: true }) => Some(FetchingInitial),
            (Idle, BecomeActive { local_store_empty: false }) => Some(FetchingIncremental),
            (FetchingInitial | FetchingIncremental, FetchSucceeded) => Some(Merging),
            (Merging, MergeDone) => Some(PushingLocal),
            (PushingLocal, PushDone) => Some(Idle),
            (state, TemporaryError | PermanentError) if state.is_active() => Some(Idle),
            (Suspended, ConnectivityLost) => None,
            (_, ConnectivityLost) => Some(Suspended),
            (Suspended, ConnectivityRestored) => Some(Idle),
            _ => None,
        }
    }
}

/// Counts from one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub initial: bool,
    pub merged: usize,
    pub deleted_locally: usize,
    pub uploaded: usize,
    pub deleted_remotely: usize,
    pub conflicts: usize,
    pub deferred: usize,
}

/// How a sync cycle ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Remote unavailable; nothing was advanced past the last commit
    TemporaryFailure { reason: String },
    /// The remote rejected the fetch itself
    PermanentFailure { reason: String },
    /// Connectivity was lost while the cycle was in flight
    Abandoned,
    /// Not started: suspended or another cycle running
    Skipped { state: SyncState },
}

/// Notifications for observers
#[derive(Debug, Clone)]
pub enum SyncEvent {
    StateChanged { from: SyncState, to: SyncState },
    StoreChanged(CommitEvent),
    ConflictsDetected(Vec<LocalId>),
    CycleFinished(CycleOutcome),
}

/// Convert local list fields to their remote form; `None` lists the
/// member books that have no remote identity yet.
pub(crate) fn list_payload(
    fields: &ListFields,
    remote_of: impl Fn(&LocalId) -> Option<RemoteId>,
) -> Result<RemoteListFields, Vec<LocalId>> {
    let mut books = Vec::with_capacity(fields.books.len());
    let mut missing = Vec::new();
    for id in &fields.books {
        match remote_of(id) {
            Some(remote) => books.push(remote),
            None => missing.push(id.clone()),
        }
    }
    if missing.is_empty() {
        Ok(RemoteListFields {
            name: fields.name.clone(),
            books,
        })
    } else {
        Err(missing)
    }
}

// ============================================================================
// Tests
// ============================================================================
