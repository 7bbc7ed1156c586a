//! Sync cursors persisted in the tenant-scoped settings table

use chrono::{DateTime, Utc};

use super::store::LocalStore;
use crate::error::Result;
use crate::models::TenantId;
use crate::util::{from_millis, to_millis};

const LAST_SYNC_TIME: &str = "last_sync_time";
const LAST_UPLOAD_TIME: &str = "last_upload_time";

/// Typed access to the two cursors the sync engine keeps per tenant.
///
/// `last_sync_time` is stored as RFC 3339, `last_upload_time` as epoch millis.
/// An unparseable stored value reads as absent.
pub struct SyncCursors<'a, S: LocalStore + ?Sized> {
    store: &'a S,
    tenant: TenantId,
}

impl<'a, S: LocalStore + ?Sized> SyncCursors<'a, S> {
    pub const fn new(store: &'a S, tenant: TenantId) -> Self {
        Self { store, tenant }
    }

    /// Point up to which remote changes have been merged locally
    pub fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        let value = self.store.load_setting(self.tenant, LAST_SYNC_TIME)?;
        Ok(value.and_then(|value| match DateTime::parse_from_rfc3339(value.trim()) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(error) => {
                tracing::warn!(%error, "Ignoring unparseable last_sync_time");
                None
            }
        }))
    }

    pub fn set_last_sync_time(&self, value: DateTime<Utc>) -> Result<()> {
        self.store
            .save_setting(self.tenant, LAST_SYNC_TIME, &value.to_rfc3339())
    }

    /// Time of the last successful cloud upload
    pub fn last_upload_time(&self) -> Result<Option<DateTime<Utc>>> {
        let value = self.store.load_setting(self.tenant, LAST_UPLOAD_TIME)?;
        Ok(value
            .and_then(|value| value.trim().parse::<i64>().ok())
            .map(from_millis))
    }

    pub fn set_last_upload_time(&self, value: DateTime<Utc>) -> Result<()> {
        self.store
            .save_setting(self.tenant, LAST_UPLOAD_TIME, &to_millis(value).to_string())
    }
}
