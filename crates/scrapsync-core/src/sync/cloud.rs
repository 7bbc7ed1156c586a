//! HTTP client for the central cloud store.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{parse_api_error, SyncError};
use crate::models::{ChangedData, EntityKind, TenantId};
use crate::util::{is_http_url, normalize_text_option};

/// Serialized push bodies above this size are sent in batches
pub const BATCH_THRESHOLD_BYTES: usize = 512_000;
/// Records per batch request
pub const BATCH_SIZE: usize = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HASH_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest<'a> {
    activation_id: TenantId,
    data: &'a ChangedData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    merged: Option<usize>,
    #[serde(default)]
    conflicts: Option<usize>,
    #[serde(default)]
    id_map: Vec<IdMapping>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdMapping {
    table: String,
    id: i64,
    cloud_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PullResponse {
    Wrapped { data: ChangedData },
    Bare(ChangedData),
}

#[derive(Debug, Deserialize)]
struct HashResponse {
    hash: Option<String>,
}

/// What the cloud acknowledged for a push
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Records sent and acknowledged
    pub accepted: usize,
    /// Records the cloud reports as merged, when it says
    pub merged: Option<usize>,
    pub conflicts: Option<usize>,
    /// Requests issued; more than one means batched mode was used
    pub requests: usize,
    /// Cloud ids assigned to newly uploaded records
    pub cloud_ids: Vec<(EntityKind, i64, i64)>,
}

impl PushOutcome {
    /// Cloud id assigned to a record, if the cloud reported one
    pub fn cloud_id(&self, kind: EntityKind, id: i64) -> Option<i64> {
        self.cloud_ids
            .iter()
            .find(|(candidate, local_id, _)| *candidate == kind && *local_id == id)
            .map(|(_, _, cloud_id)| *cloud_id)
    }

    fn absorb(&mut self, response: PushResponse, accepted: usize) {
        self.accepted += accepted;
        self.requests += 1;
        if let Some(merged) = response.merged {
            self.merged = Some(self.merged.unwrap_or_default() + merged);
        }
        if let Some(conflicts) = response.conflicts {
            self.conflicts = Some(self.conflicts.unwrap_or_default() + conflicts);
        }
        for mapping in response.id_map {
            match EntityKind::from_key(&mapping.table) {
                Some(kind) => self.cloud_ids.push((kind, mapping.id, mapping.cloud_id)),
                None => tracing::debug!(table = %mapping.table, "Ignoring id mapping for unknown table"),
            }
        }
    }
}

/// Pulls and pushes changed-data envelopes against `{base}/sync/*`
#[derive(Clone)]
pub struct CloudSyncClient {
    base_url: String,
    tenant: TenantId,
    client: reqwest::Client,
}

impl CloudSyncClient {
    pub fn new(base_url: impl Into<String>, tenant: TenantId) -> Result<Self, SyncError> {
        let base_url = normalize_text_option(Some(base_url.into())).ok_or_else(|| {
            SyncError::InvalidConfiguration("cloud URL must not be empty".to_string())
        })?;
        if !is_http_url(&base_url) {
            return Err(SyncError::InvalidConfiguration(
                "cloud URL must include http:// or https://".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            tenant,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Records changed in the cloud since `since` (everything when `None`).
    ///
    /// HTTP 404 means the server has no sync endpoints and maps to
    /// [`SyncError::SyncUnsupported`].
    pub async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<ChangedData, SyncError> {
        let mut query = vec![("activationId", self.tenant.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::Millis, true)));
        }

        let response = self
            .client
            .get(format!("{}/sync/pull", self.base_url))
            .query(&query)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::SyncUnsupported);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(parse_api_error(status, &body));
        }

        let envelope = match response.json::<PullResponse>().await? {
            PullResponse::Wrapped { data } | PullResponse::Bare(data) => data,
        };
        tracing::debug!(records = envelope.total_records(), "Pulled cloud changes");
        Ok(envelope)
    }

    /// Push an envelope, switching to batched mode for large payloads.
    ///
    /// In batched mode each kind is sent in slices of [`BATCH_SIZE`], one
    /// request at a time. The first failing batch aborts the rest; batches
    /// already accepted stay accepted.
    pub async fn push(&self, envelope: &ChangedData) -> Result<PushOutcome, SyncError> {
        if envelope.is_empty() {
            return Ok(PushOutcome::default());
        }

        let body = self.encode(envelope)?;
        if body.len() > BATCH_THRESHOLD_BYTES {
            tracing::info!(
                bytes = body.len(),
                records = envelope.total_records(),
                "Push payload exceeds threshold; sending in batches"
            );
            return self.push_batched(envelope).await;
        }

        let mut outcome = PushOutcome::default();
        match self.send_push(body).await {
            Ok(response) => {
                outcome.absorb(response, envelope.total_records());
                Ok(outcome)
            }
            Err(SyncError::PayloadTooLarge) => {
                tracing::warn!("Cloud rejected push as too large; retrying in batches");
                self.push_batched(envelope).await
            }
            Err(error) => Err(error),
        }
    }

    async fn push_batched(&self, envelope: &ChangedData) -> Result<PushOutcome, SyncError> {
        let batches = envelope.split_batches(BATCH_SIZE);
        let total = batches.len();
        let mut outcome = PushOutcome::default();

        for (index, (kind, batch)) in batches.into_iter().enumerate() {
            let records = batch.total_records();
            let response = self.send_push(self.encode(&batch)?).await.map_err(|error| {
                tracing::warn!(
                    %kind,
                    batch = index + 1,
                    total,
                    %error,
                    "Batch push failed; aborting remaining batches"
                );
                error
            })?;
            outcome.absorb(response, records);
        }

        Ok(outcome)
    }

    fn encode(&self, envelope: &ChangedData) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(&PushRequest {
            activation_id: self.tenant,
            data: envelope,
        })
        .map_err(|error| SyncError::InvalidPayload(error.to_string()))
    }

    async fn send_push(&self, body: Vec<u8>) -> Result<PushResponse, SyncError> {
        let response = self
            .client
            .post(format!("{}/sync/push", self.base_url))
            .header(CONTENT_TYPE, "application/json")
            .header("Accept", "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Err(SyncError::PayloadTooLarge);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::SyncUnsupported);
        }
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(parse_api_error(status, &text));
        }

        let payload = if text.trim().is_empty() {
            PushResponse::default()
        } else {
            serde_json::from_str::<PushResponse>(&text)
                .map_err(|error| SyncError::InvalidPayload(error.to_string()))?
        };
        if payload.success == Some(false) {
            return Err(SyncError::Protocol {
                status: status.as_u16(),
                message: payload
                    .error
                    .unwrap_or_else(|| "push was not accepted".to_string()),
            });
        }
        Ok(payload)
    }

    /// The cloud's fingerprint of this tenant's data, `None` when unavailable
    pub async fn fetch_hash(&self) -> Option<String> {
        let response = self
            .client
            .get(format!("{}/sync/hash", self.base_url))
            .query(&[("activationId", self.tenant.to_string())])
            .timeout(HASH_TIMEOUT)
            .send()
            .await;

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::debug!(status = %response.status(), "Cloud fingerprint unavailable");
                return None;
            }
            Err(error) => {
                tracing::debug!(%error, "Cloud fingerprint request failed");
                return None;
            }
        };

        response
            .json::<HashResponse>()
            .await
            .ok()
            .and_then(|payload| normalize_text_option(payload.hash))
    }

    /// Whether the cloud answers at all; any HTTP response counts
    pub async fn is_reachable(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Customer, Weighing};
    use crate::sync::test_support::{pushed_kinds, MockCloud};
    use pretty_assertions::assert_eq;

    const TENANT: TenantId = TenantId(12);

    fn client(base_url: &str) -> CloudSyncClient {
        CloudSyncClient::new(base_url, TENANT).unwrap()
    }

    fn large_envelope(weighings: i64) -> ChangedData {
        let photo = "p".repeat(2_500);
        ChangedData {
            customers: vec![Customer::new(1, "Ada")],
            weighings: (0..weighings)
                .map(|id| Weighing {
                    photo_path: Some(photo.clone()),
                    ..Weighing::new(id + 1, 1, 10.0, 1.0, 1.0)
                })
                .collect(),
            ..ChangedData::default()
        }
    }

    #[test]
    fn new_rejects_invalid_urls() {
        assert!(CloudSyncClient::new("", TENANT).is_err());
        assert!(CloudSyncClient::new("cloud.example.com", TENANT).is_err());
        assert_eq!(
            client("https://cloud.example.com/").base_url(),
            "https://cloud.example.com"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_sends_tenant_and_cursor() {
        let cloud = MockCloud::default();
        cloud.set_pull_response(ChangedData {
            customers: vec![Customer::new(5, "Grace")],
            ..ChangedData::default()
        });
        let base = cloud.spawn().await;

        let since = crate::util::now_millis();
        let envelope = client(&base).pull(Some(since)).await.unwrap();

        assert_eq!(envelope.customers.len(), 1);
        let pulls = cloud.pulls();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].activation_id.as_deref(), Some("12"));
        assert!(pulls[0].since.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_maps_404_to_sync_unsupported() {
        let cloud = MockCloud::default();
        cloud.disable_sync();
        let base = cloud.spawn().await;

        let error = client(&base).pull(None).await.unwrap_err();
        assert!(matches!(error, SyncError::SyncUnsupported));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn small_push_is_a_single_request_with_id_map() {
        let cloud = MockCloud::default();
        cloud.assign_cloud_ids();
        let base = cloud.spawn().await;

        let envelope = ChangedData {
            customers: vec![Customer::new(1, "Ada")],
            ..ChangedData::default()
        };
        let outcome = client(&base).push(&envelope).await.unwrap();

        assert_eq!(outcome.requests, 1);
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.cloud_id(EntityKind::Customer, 1), Some(1_001));
        let pushes = cloud.pushes();
        assert_eq!(pushes[0]["activationId"], 12);
        assert_eq!(pushes[0]["data"]["customers"][0]["name"], "Ada");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn large_push_is_split_into_batches_of_100() {
        let cloud = MockCloud::default();
        let base = cloud.spawn().await;

        let envelope = large_envelope(250);
        assert!(serde_json::to_vec(&envelope).unwrap().len() > BATCH_THRESHOLD_BYTES);

        let outcome = client(&base).push(&envelope).await.unwrap();
        assert_eq!(outcome.accepted, 251);
        assert_eq!(outcome.requests, 4);

        let weighing_batches: Vec<usize> = cloud
            .pushes()
            .iter()
            .map(|push| push["data"]["weighings"].as_array().map_or(0, Vec::len))
            .filter(|count| *count > 0)
            .collect();
        assert_eq!(weighing_batches, vec![100, 100, 50]);
        for push in cloud.pushes() {
            assert_eq!(pushed_kinds(&push).len(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn payload_too_large_triggers_one_batched_retry() {
        let cloud = MockCloud::default();
        cloud.reject_requests_over(100);
        let base = cloud.spawn().await;

        let envelope = ChangedData {
            customers: (1..=150).map(|id| Customer::new(id, "Bulk")).collect(),
            ..ChangedData::default()
        };
        let outcome = client(&base).push(&envelope).await.unwrap();

        assert_eq!(outcome.accepted, 150);
        assert_eq!(outcome.requests, 2);
        assert_eq!(cloud.pushes().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_batch_aborts_remaining_batches() {
        let cloud = MockCloud::default();
        cloud.fail_pushes_after(1);
        let base = cloud.spawn().await;

        let error = client(&base).push(&large_envelope(250)).await.unwrap_err();
        assert!(matches!(error, SyncError::Protocol { status: 500, .. }));
        assert_eq!(cloud.pushes().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_hash_and_reachability() {
        let cloud = MockCloud::default();
        cloud.set_hash("abc123");
        let base = cloud.spawn().await;

        let client = client(&base);
        assert_eq!(client.fetch_hash().await.as_deref(), Some("abc123"));
        assert!(client.is_reachable().await);

        let offline = CloudSyncClient::new("http://127.0.0.1:9", TENANT).unwrap();
        assert!(offline.fetch_hash().await.is_none());
        assert!(!offline.is_reachable().await);
    }
}
