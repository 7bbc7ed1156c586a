//! Local store interface consumed by the sync engine

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::schema::SchemaCapabilities;
use crate::error::Result;
use crate::models::{ChangedData, Customer, CustomerKey, EntityKind, Record, TenantId};

/// Which records belong in a changed-data envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFilter {
    /// Records flagged `needs_upload`. Tables without the flag fall back to
    /// `updated_at`/`created_at` newer than `since` (everything when `None`).
    PendingUpload { since: Option<DateTime<Utc>> },
    /// Records whose `updated_at` (or `created_at`) is strictly after the cursor
    Since(DateTime<Utc>),
    /// Every record of the tenant
    All,
}

/// Acknowledgment of one pushed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub kind: EntityKind,
    pub id: i64,
    /// Effective `updated_at` of the version that was pushed
    pub pushed_version: DateTime<Utc>,
    pub cloud_id: Option<i64>,
}

/// Timestamp-independent aggregates over a tenant's data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreAggregates {
    /// Record count per kind, in [`EntityKind::ALL`] order
    pub counts: Vec<(EntityKind, i64)>,
    pub id_sum: i64,
    /// Customers and metal types with a non-empty name
    pub named_count: i64,
    /// Sum of weighing net weights, each truncated to an integer
    pub weight_sum: i64,
    /// Sum of weighing amounts and session totals, each truncated to an integer
    pub amount_sum: i64,
}

impl StoreAggregates {
    pub fn count(&self, kind: EntityKind) -> i64 {
        self.counts
            .iter()
            .find(|(candidate, _)| *candidate == kind)
            .map_or(0, |(_, count)| *count)
    }

    pub fn total_records(&self) -> i64 {
        self.counts.iter().map(|(_, count)| count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_records() == 0
    }
}

/// Tenant-scoped persistence the sync engine reads from and merges into.
///
/// Implementations must tolerate concurrent writes from the application's own
/// CRUD paths between any two calls.
pub trait LocalStore: Send + Sync {
    /// Cached schema capabilities
    fn capabilities(&self) -> SchemaCapabilities;

    /// Build an envelope of the tenant's changed records
    fn list_changed(&self, tenant: TenantId, filter: ChangeFilter) -> Result<ChangedData>;

    fn find(&self, tenant: TenantId, kind: EntityKind, id: i64) -> Result<Option<Record>>;

    fn find_customer_by_business_key(
        &self,
        tenant: TenantId,
        key: &CustomerKey,
    ) -> Result<Option<Customer>>;

    fn exists(&self, tenant: TenantId, kind: EntityKind, id: i64) -> Result<bool>;

    /// Remember that another device's customer `remote_id` is the local
    /// customer `local_id`
    fn save_customer_alias(&self, tenant: TenantId, remote_id: i64, local_id: i64) -> Result<()>;

    /// Local customer id previously matched to another device's `remote_id`
    fn customer_alias(&self, tenant: TenantId, remote_id: i64) -> Result<Option<i64>>;

    /// Insert the record or replace the stored row with the same `(tenant, id)`.
    ///
    /// A stored non-null `cloud_id` is never replaced.
    fn upsert(&self, tenant: TenantId, record: &Record) -> Result<()>;

    /// Clear `needs_upload` if the stored version is still the one that was pushed.
    ///
    /// Returns `false` when the row changed since the push (or no longer exists).
    fn mark_uploaded(&self, tenant: TenantId, receipt: &UploadReceipt) -> Result<bool>;

    fn aggregates(&self, tenant: TenantId) -> Result<StoreAggregates>;

    /// Maximum `updated_at`/`created_at` across all of the tenant's records
    fn latest_change(&self, tenant: TenantId) -> Result<Option<DateTime<Utc>>>;

    fn load_setting(&self, tenant: TenantId, key: &str) -> Result<Option<String>>;

    fn save_setting(&self, tenant: TenantId, key: &str, value: &str) -> Result<()>;

    /// Add missing tables/columns and refresh the cached capabilities
    fn repair_schema(&self) -> Result<()>;
}
