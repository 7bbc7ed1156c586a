//! Shared shape of every syncable entity

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BiometricRecord, Customer, MetalType, Vehicle, Weighing, WeighingSession};

/// Activation id isolating one installation's data from all others
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl TenantId {
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// The six entity kinds exchanged by the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Customer,
    Vehicle,
    MetalType,
    WeighingSession,
    Weighing,
    BiometricRecord,
}

impl EntityKind {
    /// All kinds, parents before the children that reference them.
    pub const ALL: [Self; 6] = [
        Self::Customer,
        Self::Vehicle,
        Self::MetalType,
        Self::WeighingSession,
        Self::Weighing,
        Self::BiometricRecord,
    ];

    /// Local table backing this kind
    pub const fn table(self) -> &'static str {
        match self {
            Self::Customer => "customers",
            Self::Vehicle => "vehicles",
            Self::MetalType => "metal_types",
            Self::WeighingSession => "weighing_sessions",
            Self::Weighing => "weighings",
            Self::BiometricRecord => "biometric_data",
        }
    }

    /// Key used for this kind inside a changed-data envelope
    pub const fn envelope_key(self) -> &'static str {
        match self {
            Self::Customer => "customers",
            Self::Vehicle => "vehicles",
            Self::MetalType => "metalTypes",
            Self::WeighingSession => "weighingSessions",
            Self::Weighing => "weighings",
            Self::BiometricRecord => "biometricData",
        }
    }

    /// Resolve a kind from its envelope key or table name
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.envelope_key() == key || kind.table() == key)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.envelope_key())
    }
}

/// Identity, timestamps and upload marker common to every entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    /// Local-store-assigned identifier, unique within the tenant
    pub id: i64,
    /// Identifier assigned by the cloud store after a confirmed upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Absent on older schema versions
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Local mutation not yet acknowledged by the cloud. Never sent on the wire.
    #[serde(skip)]
    pub needs_upload: bool,
}

impl RecordMeta {
    /// A freshly created local record
    #[must_use]
    pub fn new(id: i64) -> Self {
        let now = crate::util::now_millis();
        Self {
            id,
            cloud_id: None,
            created_at: now,
            updated_at: Some(now),
            needs_upload: true,
        }
    }

    /// Drop sub-millisecond precision from both timestamps
    pub fn truncate_to_millis(&mut self) {
        self.created_at = crate::util::truncate_millis(self.created_at);
        self.updated_at = self.updated_at.map(crate::util::truncate_millis);
    }

    /// `updated_at`, falling back to `created_at`
    #[must_use]
    pub fn effective_updated_at(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    /// Whether `other` carries a strictly newer version than `self`
    #[must_use]
    pub fn is_older_than(&self, other: &Self) -> bool {
        other.effective_updated_at() > self.effective_updated_at()
    }

    /// Take over the version of a newer remote copy.
    ///
    /// The local id and creation time are kept, a non-null `cloud_id` is never
    /// replaced, and the record is no longer pending upload.
    pub fn absorb(&mut self, incoming: &Self) {
        self.cloud_id = self.cloud_id.or(incoming.cloud_id);
        self.updated_at = Some(incoming.effective_updated_at());
        self.needs_upload = false;
    }
}

/// Behaviour the merge engine needs from each entity kind
pub trait Syncable: Clone + Sized {
    const KIND: EntityKind;

    fn meta(&self) -> &RecordMeta;

    fn meta_mut(&mut self) -> &mut RecordMeta;

    /// Parent that must exist locally before this record can be inserted
    fn parent(&self) -> Option<(EntityKind, i64)> {
        None
    }

    /// Overwrite mutable fields from a strictly newer remote copy.
    ///
    /// Optional fields coalesce: an incoming `None` keeps the existing value.
    fn absorb(&mut self, incoming: &Self);

    fn into_record(self) -> Record;

    fn from_record(record: Record) -> Option<Self>;
}

/// Any entity, tagged with its kind
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Customer(Customer),
    Vehicle(Vehicle),
    MetalType(MetalType),
    WeighingSession(WeighingSession),
    Weighing(Weighing),
    BiometricRecord(BiometricRecord),
}

impl Record {
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Customer(_) => EntityKind::Customer,
            Self::Vehicle(_) => EntityKind::Vehicle,
            Self::MetalType(_) => EntityKind::MetalType,
            Self::WeighingSession(_) => EntityKind::WeighingSession,
            Self::Weighing(_) => EntityKind::Weighing,
            Self::BiometricRecord(_) => EntityKind::BiometricRecord,
        }
    }

    pub const fn meta(&self) -> &RecordMeta {
        match self {
            Self::Customer(record) => &record.meta,
            Self::Vehicle(record) => &record.meta,
            Self::MetalType(record) => &record.meta,
            Self::WeighingSession(record) => &record.meta,
            Self::Weighing(record) => &record.meta,
            Self::BiometricRecord(record) => &record.meta,
        }
    }
}

/// Coalesce an optional field: incoming wins unless it is absent.
pub(crate) fn coalesce<T: Clone>(existing: &mut Option<T>, incoming: &Option<T>) {
    if incoming.is_some() {
        existing.clone_from(incoming);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn effective_timestamp_falls_back_to_created_at() {
        let meta = RecordMeta {
            id: 1,
            cloud_id: None,
            created_at: at(100),
            updated_at: None,
            needs_upload: false,
        };
        assert_eq!(meta.effective_updated_at(), at(100));
    }

    #[test]
    fn ties_are_not_newer() {
        let local = RecordMeta {
            updated_at: Some(at(200)),
            ..RecordMeta::new(1)
        };
        let remote = local.clone();
        assert!(!local.is_older_than(&remote));
    }

    #[test]
    fn absorb_never_replaces_cloud_id() {
        let mut local = RecordMeta {
            cloud_id: Some(10),
            ..RecordMeta::new(1)
        };
        let remote = RecordMeta {
            cloud_id: Some(99),
            updated_at: Some(at(4_000_000_000)),
            ..RecordMeta::new(1)
        };
        local.absorb(&remote);
        assert_eq!(local.cloud_id, Some(10));
        assert_eq!(local.updated_at, Some(at(4_000_000_000)));
        assert!(!local.needs_upload);
    }

    #[test]
    fn kinds_resolve_from_envelope_keys_and_tables() {
        assert_eq!(EntityKind::from_key("biometricData"), Some(EntityKind::BiometricRecord));
        assert_eq!(EntityKind::from_key("metal_types"), Some(EntityKind::MetalType));
        assert_eq!(EntityKind::from_key("notes"), None);
    }

    #[test]
    fn needs_upload_is_not_serialized() {
        let meta = RecordMeta::new(7);
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("needsUpload").is_none());
        assert_eq!(json["id"], 7);
    }
}
