//! Discovered peer device

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::TenantId;

/// A same-tenant device seen on the local network.
///
/// Rebuilt every discovery cycle; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// `"{address}:{transfer_port}"`
    pub id: String,
    pub name: String,
    pub tenant_id: TenantId,
    /// Where the device's transfer endpoint listens
    pub address: SocketAddr,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
}

impl DeviceDescriptor {
    #[must_use]
    pub fn new(
        address: SocketAddr,
        name: impl Into<String>,
        tenant_id: TenantId,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: address.to_string(),
            name: name.into(),
            tenant_id,
            address,
            last_sync_time,
            last_seen: Utc::now(),
        }
    }

    /// Base URL of the device's transfer endpoint
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.address)
    }
}
