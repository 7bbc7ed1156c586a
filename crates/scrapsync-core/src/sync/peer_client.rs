//! Client side of the peer transfer endpoint

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use super::transfer::{PushBody, PushReply, TransferStatus};
use super::{parse_api_error, MergeStats, SyncError};
use crate::models::{ChangedData, DeviceDescriptor, TenantId};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Talks to one peer's transfer endpoint
#[derive(Clone)]
pub struct PeerClient {
    base_url: String,
    tenant: TenantId,
    client: reqwest::Client,
}

impl PeerClient {
    pub fn new(base_url: impl Into<String>, tenant: TenantId) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tenant,
            client,
        })
    }

    pub fn for_device(device: &DeviceDescriptor, tenant: TenantId) -> Result<Self, SyncError> {
        Self::new(device.base_url(), tenant)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn status(&self) -> Result<TransferStatus, SyncError> {
        let response = self
            .client
            .get(format!("{}/sync/status", self.base_url))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(parse_api_error(status, &body));
        }
        Ok(response.json().await?)
    }

    /// Records the peer changed after `since`, or its pending set when `None`
    pub async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<ChangedData, SyncError> {
        let mut query = vec![("tenantId", self.tenant.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::Millis, true)));
        }

        let response = self
            .client
            .get(format!("{}/sync/pull", self.base_url))
            .query(&query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(parse_api_error(status, &body));
        }
        Ok(response.json().await?)
    }

    /// Send an envelope for the peer to merge
    pub async fn push(&self, envelope: &ChangedData) -> Result<MergeStats, SyncError> {
        if envelope.is_empty() {
            return Ok(MergeStats::default());
        }

        let response = self
            .client
            .post(format!("{}/sync/push", self.base_url))
            .json(&PushBody {
                tenant_id: self.tenant,
                data: envelope.clone(),
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(parse_api_error(status, &body));
        }

        let reply: PushReply = response.json().await?;
        if !reply.success {
            return Err(SyncError::Protocol {
                status: status.as_u16(),
                message: "peer rejected push".to_string(),
            });
        }
        Ok(MergeStats {
            merged: reply.merged,
            conflicts: reply.conflicts,
            deferred: 0,
            total: envelope.total_records(),
        })
    }
}
