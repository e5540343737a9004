//! Console Remote - deterministic in-memory remote store
//!
//! Stands in for the cloud service in debug runs and tests. Remote ids
//! are sequential (`rec-000001`), the change token is the store's write
//! sequence number, and deletions leave tombstones so incremental fetches
//! report them. Every operation is logged at info level.

use super::models::{
    ChangeToken, LocalId, OutboundRecord, RecordPayload, RemoteChanges, RemoteId, RemoteRecord,
    UserId,
};
use super::remote::{DeleteResult, RecordKey, RemoteAdapter, RemoteError, UploadResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

const DEFAULT_USER: &str = "console-user";

struct StoredRecord {
    record: RemoteRecord,
    seq: u64,
}

#[derive(Default)]
struct ConsoleState {
    seq: u64,
    next_id: u64,
    records: BTreeMap<RemoteId, StoredRecord>,
    tombstones: BTreeMap<RemoteId, u64>,
    offline: bool,
    rejected: HashSet<LocalId>,
    user: Option<UserId>,
}

impl ConsoleState {
    fn bump(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn assign_id(&mut self) -> RemoteId {
        self.next_id += 1;
        RemoteId::new(format!("rec-{:06}", self.next_id))
    }

    fn store(&mut self, record: RemoteRecord) {
        let seq = self.bump();
        self.tombstones.remove(&record.remote_id);
        self.records.insert(record.remote_id.clone(), StoredRecord { record, seq });
    }

    fn remove(&mut self, remote_id: &RemoteId) -> bool {
        if self.records.remove(remote_id).is_some() {
            let seq = self.bump();
            self.tombstones.insert(remote_id.clone(), seq);
            true
        } else {
            false
        }
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.offline {
            Err(RemoteError::Temporary("console remote is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

/// In-memory remote store
pub struct ConsoleRemote {
    state: Mutex<ConsoleState>,
}

impl Default for ConsoleRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConsoleState {
                user: Some(UserId::new(DEFAULT_USER)),
                ..ConsoleState::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ConsoleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every operation fail with a temporary error
    pub fn set_offline(&self, offline: bool) {
        log::info!("[console] offline = {}", offline);
        self.state().offline = offline;
    }

    /// Permanently reject uploads of `local_id` until accepted again
    pub fn reject_local(&self, local_id: &LocalId) {
        self.state().rejected.insert(local_id.clone());
    }

    pub fn accept_local(&self, local_id: &LocalId) {
        self.state().rejected.remove(local_id);
    }

    /// Switch the signed-in account; `None` signs out
    pub fn set_user(&self, user: Option<UserId>) {
        log::info!("[console] user = {:?}", user);
        self.state().user = user;
    }

    /// A record created on another device
    pub fn simulate_remote_change(&self, payload: RecordPayload) -> RemoteRecord {
        let mut state = self.state();
        let record = RemoteRecord {
            remote_id: state.assign_id(),
            modified_at: crate::db::now(),
            payload,
        };
        log::info!("[console] remote insert {}", record.remote_id);
        state.store(record.clone());
        record
    }

    /// A record edited on another device; `None` if unknown
    pub fn simulate_remote_update(&self, remote_id: &RemoteId, payload: RecordPayload) -> Option<RemoteRecord> {
        let mut state = self.state();
        if !state.records.contains_key(remote_id) {
            return None;
        }
        let record = RemoteRecord {
            remote_id: remote_id.clone(),
            modified_at: crate::db::now(),
            payload,
        };
        log::info!("[console] remote update {}", remote_id);
        state.store(record.clone());
        Some(record)
    }

    /// A record deleted on another device
    pub fn simulate_remote_delete(&self, remote_id: &RemoteId) -> bool {
        log::info!("[console] remote delete {}", remote_id);
        self.state().remove(remote_id)
    }

    /// Every live record, ordered by remote id
    pub fn records(&self) -> Vec<RemoteRecord> {
        self.state().records.values().map(|s| s.record.clone()).collect()
    }

    pub fn get(&self, remote_id: &RemoteId) -> Option<RemoteRecord> {
        self.state().records.get(remote_id).map(|s| s.record.clone())
    }

    /// Token a fetch made now would return
    pub fn current_token(&self) -> ChangeToken {
        ChangeToken::new(self.state().seq.to_string())
    }
}

#[async_trait]
impl RemoteAdapter for ConsoleRemote {
    fn name(&self) -> &str {
        "console"
    }

    async fn fetch_all(&self) -> Result<Vec<RemoteRecord>, RemoteError> {
        let state = self.state();
        state.check_online()?;
        log::info!("[console] fetch_all -> {} records", state.records.len());
        Ok(state.records.values().map(|s| s.record.clone()).collect())
    }

    async fn fetch_changes(&self, since: Option<&ChangeToken>) -> Result<RemoteChanges, RemoteError> {
        let state = self.state();
        state.check_online()?;

        let since = match since {
            None => 0,
            Some(token) => token.as_str().parse::<u64>().map_err(|_| RemoteError::Permanent {
                affected: Vec::new(),
                reason: format!("unknown change token {:?}", token.as_str()),
            })?,
        };

        let mut changed: Vec<&StoredRecord> = state.records.values().filter(|s| s.seq > since).collect();
        changed.sort_by_key(|s| s.seq);
        let changed: Vec<RemoteRecord> = changed.into_iter().map(|s| s.record.clone()).collect();
        let deleted: Vec<RemoteId> = state
            .tombstones
            .iter()
            .filter(|(_, seq)| **seq > since)
            .map(|(id, _)| id.clone())
            .collect();

        log::info!(
            "[console] fetch_changes since {} -> {} changed, {} deleted, token {}",
            since,
            changed.len(),
            deleted.len(),
            state.seq
        );

        Ok(RemoteChanges {
            changed,
            deleted,
            token: ChangeToken::new(state.seq.to_string()),
        })
    }

    async fn upload(&self, records: &[OutboundRecord]) -> UploadResult {
        let mut state = self.state();
        if let Err(e) = state.check_online() {
            return UploadResult {
                succeeded: Vec::new(),
                failure: Some(e),
            };
        }

        let mut result = UploadResult::default();
        let mut rejected = Vec::new();
        for outbound in records {
            if state.rejected.contains(&outbound.local_id) {
                rejected.push(RecordKey::Local(outbound.local_id.clone()));
                continue;
            }

            let remote_id = match &outbound.remote_id {
                Some(id) => id.clone(),
                None => state.assign_id(),
            };
            let record = RemoteRecord {
                remote_id,
                modified_at: outbound.modified_at,
                payload: outbound.payload.clone(),
            };
            state.store(record.clone());
            result.succeeded.push((outbound.local_id.clone(), record));
        }

        log::info!(
            "[console] upload {} records -> {} stored, {} rejected",
            records.len(),
            result.succeeded.len(),
            rejected.len()
        );

        if !rejected.is_empty() {
            result.failure = Some(RemoteError::Permanent {
                affected: rejected,
                reason: "record rejected by console remote".to_string(),
            });
        }
        result
    }

    async fn delete(&self, remote_ids: &[RemoteId]) -> DeleteResult {
        let mut state = self.state();
        if let Err(e) = state.check_online() {
            return DeleteResult {
                succeeded: Vec::new(),
                failure: Some(e),
            };
        }

        for id in remote_ids {
            state.remove(id);
        }
        log::info!("[console] delete {} records", remote_ids.len());

        DeleteResult {
            succeeded: remote_ids.to_vec(),
            failure: None,
        }
    }

    async fn fetch_user_identity(&self) -> Result<Option<UserId>, RemoteError> {
        let state = self.state();
        state.check_online()?;
        Ok(state.user.clone())
    }
}

/// Remote that is never reachable
#[derive(Debug, Default)]
pub struct OfflineRemote;

fn offline() -> RemoteError {
    RemoteError::Temporary("sync is offline".to_string())
}

#[async_trait]
impl RemoteAdapter for OfflineRemote {
    fn name(&self) -> &str {
        "offline"
    }

    async fn fetch_all(&self) -> Result<Vec<RemoteRecord>, RemoteError> {
        Err(offline())
    }

    async fn fetch_changes(&self, _since: Option<&ChangeToken>) -> Result<RemoteChanges, RemoteError> {
        Err(offline())
    }

    async fn upload(&self, _records: &[OutboundRecord]) -> UploadResult {
        UploadResult {
            succeeded: Vec::new(),
            failure: Some(offline()),
        }
    }

    async fn delete(&self, _remote_ids: &[RemoteId]) -> DeleteResult {
        DeleteResult {
            succeeded: Vec::new(),
            failure: Some(offline()),
        }
    }

    async fn fetch_user_identity(&self) -> Result<Option<UserId>, RemoteError> {
        Err(offline())
    }
}
