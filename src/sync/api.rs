//! HTTP Remote - JSON record service client
//!
//! Endpoints, relative to the configured base URL:
//! - `GET  records`             every live record
//! - `GET  changes?since=`      records changed and deleted since a token
//! - `POST records`             create or update records
//! - `POST records/delete`      delete records by remote id
//! - `GET  user`                signed-in account (401 when signed out)
//!
//! 400/409/422 are permanent rejections whose body names the rejected
//! records; 401/403, 429, 5xx and transport failures are temporary.

use super::models::{ChangeToken, LocalId, OutboundRecord, RemoteChanges, RemoteId, RemoteRecord, UserId};
use super::remote::{DeleteResult, RecordKey, RemoteAdapter, RemoteError, UploadResult};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Remote adapter for the HTTP record service
pub struct HttpRemote {
    client: Client,
    base: Url,
    /// Bearer token sent with every request
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, HttpSetupError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self { client, base, token })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base
            .join(path)
            .map_err(|e| RemoteError::Temporary(format!("invalid endpoint {}: {}", path, e)))
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(url))
    }

    fn post(&self, url: Url) -> reqwest::RequestBuilder {
        self.authorize(self.client.post(url))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        key: fn(String) -> RecordKey,
    ) -> Result<T, RemoteError> {
        let response = request.send().await.map_err(transport_error)?;
        handle_response(response, key).await
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordsResponse {
    records: Vec<RemoteRecord>,
}

#[derive(Debug, Clone, Serialize)]
struct UploadRequest<'a> {
    records: &'a [OutboundRecord],
}

#[derive(Debug, Clone, Deserialize)]
struct StoredRecord {
    local_id: LocalId,
    record: RemoteRecord,
}

#[derive(Debug, Clone, Deserialize)]
struct Rejection {
    id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    stored: Vec<StoredRecord>,
    #[serde(default)]
    rejected: Vec<Rejection>,
}

#[derive(Debug, Clone, Serialize)]
struct DeleteRequest<'a> {
    remote_ids: &'a [RemoteId],
}

#[derive(Debug, Clone, Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    deleted: Vec<RemoteId>,
    #[serde(default)]
    rejected: Vec<Rejection>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserResponse {
    user_id: Option<UserId>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    rejected: Vec<Rejection>,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HttpSetupError {
    #[error("Invalid remote URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Failed to create HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Temporary(format!("request failed: {}", e))
}

fn rejection(rejected: Vec<Rejection>, fallback: String, key: fn(String) -> RecordKey) -> RemoteError {
    let reason = rejected
        .iter()
        .find_map(|r| r.reason.clone())
        .unwrap_or(fallback);
    RemoteError::Permanent {
        affected: rejected.into_iter().map(|r| key(r.id)).collect(),
        reason,
    }
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    key: fn(String) -> RecordKey,
) -> Result<T, RemoteError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Temporary(format!("invalid response: {}", e)))
    } else {
        Err(handle_error(response, key).await)
    }
}

/// Convert error response to RemoteError
async fn handle_error(response: reqwest::Response, key: fn(String) -> RecordKey) -> RemoteError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            let parsed: Option<ErrorResponse> = serde_json::from_str(&body).ok();
            let (message, rejected) = match parsed {
                Some(e) => (e.error, e.rejected),
                None => (None, Vec::new()),
            };
            rejection(rejected, message.unwrap_or_else(|| format!("{}: {}", status, body)), key)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::Temporary(format!("not authorized ({})", status))
        }
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Temporary("rate limit exceeded".to_string()),
        s if s.is_server_error() => RemoteError::Temporary(format!("server error {}: {}", s, body)),
        _ => RemoteError::Permanent {
            affected: Vec::new(),
            reason: format!("{}: {}", status, body),
        },
    }
}

fn local_key(id: String) -> RecordKey {
    RecordKey::Local(LocalId::from(id.as_str()))
}

fn remote_key(id: String) -> RecordKey {
    RecordKey::Remote(RemoteId::new(id))
}

// ============================================================================
// Adapter
// ============================================================================

#[async_trait]
impl RemoteAdapter for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_all(&self) -> Result<Vec<RemoteRecord>, RemoteError> {
        let url = self.endpoint("records")?;
        let response: RecordsResponse = self.send(self.get(url), remote_key).await?;
        log::info!("Fetched {} records from {}", response.records.len(), self.base);
        Ok(response.records)
    }

    async fn fetch_changes(&self, since: Option<&ChangeToken>) -> Result<RemoteChanges, RemoteError> {
        let mut url = self.endpoint("changes")?;
        if let Some(token) = since {
            url.query_pairs_mut().append_pair("since", token.as_str());
        }

        let changes: RemoteChanges = self.send(self.get(url), remote_key).await?;
        log::info!(
            "Fetched {} changed and {} deleted records",
            changes.changed.len(),
            changes.deleted.len()
        );
        Ok(changes)
    }

    async fn upload(&self, records: &[OutboundRecord]) -> UploadResult {
        if records.is_empty() {
            return UploadResult::default();
        }

        let url = match self.endpoint("records") {
            Ok(url) => url,
            Err(e) => {
                return UploadResult {
                    succeeded: Vec::new(),
                    failure: Some(e),
                }
            }
        };

        let request = self.post(url).json(&UploadRequest { records });
        match self.send::<UploadResponse>(request, local_key).await {
            Ok(response) => {
                log::info!(
                    "Uploaded {} records ({} rejected)",
                    response.stored.len(),
                    response.rejected.len()
                );
                let failure = (!response.rejected.is_empty()).then(|| {
                    rejection(response.rejected, "record rejected".to_string(), local_key)
                });
                UploadResult {
                    succeeded: response
                        .stored
                        .into_iter()
                        .map(|s| (s.local_id, s.record))
                        .collect(),
                    failure,
                }
            }
            Err(RemoteError::Permanent { affected, reason }) if affected.is_empty() => {
                // Nothing named: the whole batch was refused
                UploadResult {
                    succeeded: Vec::new(),
                    failure: Some(RemoteError::Permanent {
                        affected: records.iter().map(|r| RecordKey::Local(r.local_id.clone())).collect(),
                        reason,
                    }),
                }
            }
            Err(e) => UploadResult {
                succeeded: Vec::new(),
                failure: Some(e),
            },
        }
    }

    async fn delete(&self, remote_ids: &[RemoteId]) -> DeleteResult {
        if remote_ids.is_empty() {
            return DeleteResult::default();
        }

        let url = match self.endpoint("records/delete") {
            Ok(url) => url,
            Err(e) => {
                return DeleteResult {
                    succeeded: Vec::new(),
                    failure: Some(e),
                }
            }
        };

        let request = self.post(url).json(&DeleteRequest { remote_ids });
        match self.send::<DeleteResponse>(request, remote_key).await {
            Ok(response) => {
                log::info!("Deleted {} remote records", response.deleted.len());
                let failure = (!response.rejected.is_empty()).then(|| {
                    rejection(response.rejected, "delete rejected".to_string(), remote_key)
                });
                DeleteResult {
                    succeeded: response.deleted,
                    failure,
                }
            }
            Err(RemoteError::Permanent { affected, reason }) if affected.is_empty() => DeleteResult {
                succeeded: Vec::new(),
                failure: Some(RemoteError::Permanent {
                    affected: remote_ids.iter().cloned().map(RecordKey::Remote).collect(),
                    reason,
                }),
            },
            Err(e) => DeleteResult {
                succeeded: Vec::new(),
                failure: Some(e),
            },
        }
    }

    async fn fetch_user_identity(&self) -> Result<Option<UserId>, RemoteError> {
        let url = self.endpoint("user")?;
        let response = self.get(url).send().await.map_err(transport_error)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }

        let user: UserResponse = handle_response(response, remote_key).await?;
        Ok(user.user_id)
    }
}

// ============================================================================
// Tests
// ============================================================================
