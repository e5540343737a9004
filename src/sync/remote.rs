//! Remote Adapter - boundary over the remote record store
//!
//! Concrete remotes (HTTP service, console stand-in, offline stub)
//! implement `RemoteAdapter`. The permanent/temporary split of
//! `RemoteError` decides the coordinator's retry policy.

use super::models::{ChangeToken, LocalId, OutboundRecord, RemoteChanges, RemoteId, RemoteRecord, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identity of a record named in a remote error
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RecordKey {
    Local(LocalId),
    Remote(RemoteId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Will never succeed for the affected records as they are
    #[error("Rejected by remote: {reason}")]
    Permanent { affected: Vec<RecordKey>, reason: String },

    /// Retry later
    #[error("Remote unavailable: {0}")]
    Temporary(String),
}

impl RemoteError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

/// Outcome of an upload. Records not in `succeeded` were not stored.
#[derive(Debug, Clone, Default)]
pub struct UploadResult {
    pub succeeded: Vec<(LocalId, RemoteRecord)>,
    pub failure: Option<RemoteError>,
}

/// Outcome of a delete
#[derive(Debug, Clone, Default)]
pub struct DeleteResult {
    pub succeeded: Vec<RemoteId>,
    pub failure: Option<RemoteError>,
}

#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Every live record (full resync path)
    async fn fetch_all(&self) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Changes since `since`; `None` means from the beginning
    async fn fetch_changes(&self, since: Option<&ChangeToken>) -> Result<RemoteChanges, RemoteError>;

    /// Create or update records. Records without a remote identity are created.
    async fn upload(&self, records: &[OutboundRecord]) -> UploadResult;

    /// Delete records; deleting an unknown identity succeeds
    async fn delete(&self, remote_ids: &[RemoteId]) -> DeleteResult;

    /// Account the remote store belongs to; `None` when signed out
    async fn fetch_user_identity(&self) -> Result<Option<UserId>, RemoteError>;
}
