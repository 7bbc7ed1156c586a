//! Last-write-wins merge of an incoming envelope into the local store

use std::collections::HashMap;

use serde::Serialize;

use crate::db::LocalStore;
use crate::error::Result;
use crate::models::{ChangedData, Record, Syncable, TenantId};

/// Counters for one applied envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    /// Records inserted or overwritten
    pub merged: usize,
    /// Records left untouched because the local copy was as new or newer, or
    /// because applying them failed
    pub conflicts: usize,
    /// Child records whose parent does not exist locally
    pub deferred: usize,
    /// Records in the envelope
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Merged,
    Conflict,
    Deferred,
}

/// Applies envelopes for one tenant.
///
/// Kinds are processed parents first so that children arriving in the same
/// envelope find their parent. Customers created independently on two devices
/// are matched by business key; the remote id is then remembered in the store
/// and remapped to the local one for this and every later envelope.
pub struct MergeEngine<'a> {
    store: &'a dyn LocalStore,
    tenant: TenantId,
    customer_ids: HashMap<i64, i64>,
    schema_repaired: bool,
}

impl<'a> MergeEngine<'a> {
    pub fn new(store: &'a dyn LocalStore, tenant: TenantId) -> Self {
        Self {
            store,
            tenant,
            customer_ids: HashMap::new(),
            schema_repaired: false,
        }
    }

    /// Apply every record of `envelope`. Per-record failures are counted as
    /// conflicts and never abort the envelope.
    pub fn merge(mut self, envelope: &ChangedData) -> MergeStats {
        let mut stats = MergeStats {
            total: envelope.total_records(),
            ..MergeStats::default()
        };

        for record in envelope.records() {
            let kind = record.kind();
            let id = record.meta().id;
            match self.apply_with_repair(record) {
                Ok(Outcome::Merged) => stats.merged += 1,
                Ok(Outcome::Conflict) => stats.conflicts += 1,
                Ok(Outcome::Deferred) => {
                    tracing::debug!(%kind, id, "Deferring record with missing parent");
                    stats.deferred += 1;
                }
                Err(error) => {
                    tracing::warn!(%kind, id, %error, "Failed to merge record");
                    stats.conflicts += 1;
                }
            }
        }

        tracing::debug!(
            merged = stats.merged,
            conflicts = stats.conflicts,
            deferred = stats.deferred,
            total = stats.total,
            "Merged envelope"
        );
        stats
    }

    fn apply_with_repair(&mut self, record: Record) -> Result<Outcome> {
        match self.apply(record.clone()) {
            Err(error) if error.is_schema_drift() && !self.schema_repaired => {
                tracing::warn!(%error, "Local schema is missing sync columns; repairing");
                self.schema_repaired = true;
                self.store.repair_schema()?;
                self.apply(record)
            }
            other => other,
        }
    }

    fn apply(&mut self, mut record: Record) -> Result<Outcome> {
        self.remap_customer(&mut record)?;
        match record {
            Record::Customer(customer) => self.apply_typed(customer),
            Record::Vehicle(vehicle) => self.apply_typed(vehicle),
            Record::MetalType(metal_type) => self.apply_typed(metal_type),
            Record::WeighingSession(session) => self.apply_typed(session),
            Record::Weighing(weighing) => self.apply_typed(weighing),
            Record::BiometricRecord(biometric) => self.apply_typed(biometric),
        }
    }

    fn apply_typed<T: Syncable>(&mut self, mut incoming: T) -> Result<Outcome> {
        incoming.meta_mut().truncate_to_millis();

        if let Some((parent_kind, parent_id)) = incoming.parent() {
            if !self.store.exists(self.tenant, parent_kind, parent_id)? {
                return Ok(Outcome::Deferred);
            }
        }

        let incoming = incoming.into_record();
        let existing = self.locate(&incoming)?.and_then(T::from_record);
        let Some(mut incoming) = T::from_record(incoming) else {
            return Ok(Outcome::Conflict);
        };
        let Some(mut local) = existing else {
            incoming.meta_mut().needs_upload = false;
            self.store.upsert(self.tenant, &incoming.into_record())?;
            return Ok(Outcome::Merged);
        };

        if !local.meta().is_older_than(incoming.meta()) {
            return Ok(Outcome::Conflict);
        }

        local.absorb(&incoming);
        self.store.upsert(self.tenant, &local.into_record())?;
        Ok(Outcome::Merged)
    }

    /// Find the local copy of `incoming`; customers match on business key first
    fn locate(&mut self, incoming: &Record) -> Result<Option<Record>> {
        let id = incoming.meta().id;
        if let Record::Customer(customer) = incoming {
            if let Some(key) = customer.business_key() {
                if let Some(local) = self.store.find_customer_by_business_key(self.tenant, &key)? {
                    if local.meta.id != id {
                        tracing::debug!(
                            remote_id = id,
                            local_id = local.meta.id,
                            "Matched customer by business key"
                        );
                        self.store
                            .save_customer_alias(self.tenant, id, local.meta.id)?;
                        self.customer_ids.insert(id, local.meta.id);
                    }
                    return Ok(Some(Record::Customer(local)));
                }
            }
        }
        self.store.find(self.tenant, incoming.kind(), id)
    }

    fn local_customer_id(&mut self, remote_id: i64) -> Result<Option<i64>> {
        if let Some(local_id) = self.customer_ids.get(&remote_id) {
            return Ok(Some(*local_id));
        }
        let local_id = self.store.customer_alias(self.tenant, remote_id)?;
        if let Some(local_id) = local_id {
            self.customer_ids.insert(remote_id, local_id);
        }
        Ok(local_id)
    }

    /// Rewrite remote customer ids (the customer's own or a child's link) to
    /// the local ids they were matched to
    fn remap_customer(&mut self, record: &mut Record) -> Result<()> {
        let customer_id = match record {
            Record::Customer(customer) => Some(&mut customer.meta.id),
            Record::Vehicle(vehicle) => vehicle.customer_id.as_mut(),
            Record::WeighingSession(session) => Some(&mut session.customer_id),
            Record::BiometricRecord(biometric) => Some(&mut biometric.customer_id),
            Record::MetalType(_) | Record::Weighing(_) => None,
        };
        if let Some(customer_id) = customer_id {
            if let Some(local_id) = self.local_customer_id(*customer_id)? {
                *customer_id = local_id;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ChangeFilter, SqliteStore};
    use crate::models::{
        BiometricRecord, Customer, EntityKind, MetalType, Vehicle, Weighing, WeighingSession,
    };
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    const TENANT: TenantId = TenantId(3);

    fn merge(store: &SqliteStore, envelope: &ChangedData) -> MergeStats {
        MergeEngine::new(store, TENANT).merge(envelope)
    }

    fn stored_customer(store: &SqliteStore, id: i64) -> Customer {
        match store.find(TENANT, EntityKind::Customer, id).unwrap() {
            Some(Record::Customer(customer)) => customer,
            other => panic!("expected customer {id}, got {other:?}"),
        }
    }

    #[test]
    fn inserts_unknown_records_as_uploaded() {
        let store = SqliteStore::open_in_memory().unwrap();
        let envelope = ChangedData {
            customers: vec![Customer::new(1, "Ada")],
            metal_types: vec![MetalType::new(1, "CU", "Copper", 7.5)],
            ..ChangedData::default()
        };

        let stats = merge(&store, &envelope);
        assert_eq!(
            stats,
            MergeStats {
                merged: 2,
                conflicts: 0,
                deferred: 0,
                total: 2
            }
        );
        assert!(!stored_customer(&store, 1).meta.needs_upload);
    }

    #[test]
    fn newer_remote_overwrites_and_coalesces() {
        let store = SqliteStore::open_in_memory().unwrap();
        let local = Customer {
            phone: Some("555-1234".to_string()),
            ..Customer::new(1, "Ada")
        };
        store.upsert(TENANT, &Record::Customer(local.clone())).unwrap();

        let mut remote = Customer::new(1, "Ada Lovelace");
        remote.meta.updated_at = Some(local.meta.effective_updated_at() + Duration::minutes(1));
        let stats = merge(
            &store,
            &ChangedData {
                customers: vec![remote.clone()],
                ..ChangedData::default()
            },
        );

        assert_eq!(stats.merged, 1);
        let stored = stored_customer(&store, 1);
        assert_eq!(stored.name, "Ada Lovelace");
        assert_eq!(stored.phone.as_deref(), Some("555-1234"));
        assert_eq!(stored.meta.updated_at, remote.meta.updated_at);
        assert!(!stored.meta.needs_upload);
    }

    #[test]
    fn older_or_equal_remote_is_a_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        let local = Customer::new(1, "Local");
        store.upsert(TENANT, &Record::Customer(local.clone())).unwrap();

        let mut older = Customer::new(1, "Older");
        older.meta.updated_at = Some(local.meta.effective_updated_at() - Duration::minutes(1));
        let mut tie = Customer::new(1, "Tie");
        tie.meta.updated_at = local.meta.updated_at;

        for remote in [older, tie] {
            let stats = merge(
                &store,
                &ChangedData {
                    customers: vec![remote],
                    ..ChangedData::default()
                },
            );
            assert_eq!(stats.conflicts, 1);
            assert_eq!(stats.merged, 0);
        }
        let stored = stored_customer(&store, 1);
        assert_eq!(stored.name, "Local");
        assert!(stored.meta.needs_upload);
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let customer = Customer::new(1, "Ada");
        let session = WeighingSession::new(10, 1);
        let envelope = ChangedData {
            customers: vec![customer],
            weighing_sessions: vec![session],
            weighings: vec![Weighing::new(100, 10, 50.0, 10.0, 2.5)],
            ..ChangedData::default()
        };

        let first = merge(&store, &envelope);
        assert_eq!(first.merged, 3);
        let snapshot = store.list_changed(TENANT, ChangeFilter::All).unwrap();

        let second = merge(&store, &envelope);
        assert_eq!(second.merged, 0);
        assert_eq!(second.conflicts, 3);
        let mut after = store.list_changed(TENANT, ChangeFilter::All).unwrap();
        after.captured_at = snapshot.captured_at;
        assert_eq!(after, snapshot);
    }

    #[test]
    fn sub_millisecond_timestamps_stay_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut customer = Customer::new(1, "Ada");
        customer.meta.updated_at = Some(chrono::Utc::now());
        let envelope = ChangedData {
            customers: vec![customer],
            ..ChangedData::default()
        };

        assert_eq!(merge(&store, &envelope).merged, 1);
        assert_eq!(merge(&store, &envelope).merged, 0);
    }

    #[test]
    fn children_without_parent_are_deferred() {
        let store = SqliteStore::open_in_memory().unwrap();
        let envelope = ChangedData {
            weighing_sessions: vec![WeighingSession::new(10, 99)],
            weighings: vec![Weighing::new(100, 77, 5.0, 1.0, 1.0)],
            biometric_data: vec![BiometricRecord::new(5, 99)],
            ..ChangedData::default()
        };

        let stats = merge(&store, &envelope);
        assert_eq!(stats.deferred, 3);
        assert_eq!(stats.merged + stats.conflicts, 0);
        assert_eq!(stats.total, 3);
        assert!(!store.exists(TENANT, EntityKind::WeighingSession, 10).unwrap());
    }

    #[test]
    fn parents_in_same_envelope_are_applied_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let envelope = ChangedData {
            weighings: vec![Weighing::new(100, 10, 5.0, 1.0, 1.0)],
            weighing_sessions: vec![WeighingSession::new(10, 1)],
            customers: vec![Customer::new(1, "Ada")],
            ..ChangedData::default()
        };

        let stats = merge(&store, &envelope);
        assert_eq!(stats.merged, 3);
        assert_eq!(stats.deferred, 0);
    }

    #[test]
    fn business_key_match_remaps_child_customer_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        let local = Customer {
            customer_number: Some("C-42".to_string()),
            ..Customer::new(1, "Ada")
        };
        store.upsert(TENANT, &Record::Customer(local)).unwrap();

        let remote = Customer {
            customer_number: Some("C-42".to_string()),
            ..Customer::new(500, "Ada")
        };
        let vehicle = Vehicle {
            customer_id: Some(500),
            ..Vehicle::new(7, "AB-123")
        };
        let envelope = ChangedData {
            customers: vec![remote],
            vehicles: vec![vehicle],
            weighing_sessions: vec![WeighingSession::new(20, 500)],
            biometric_data: vec![BiometricRecord::new(30, 500)],
            ..ChangedData::default()
        };

        let stats = merge(&store, &envelope);
        assert_eq!(stats.deferred, 0);
        assert!(!store.exists(TENANT, EntityKind::Customer, 500).unwrap());

        let Some(Record::WeighingSession(session)) =
            store.find(TENANT, EntityKind::WeighingSession, 20).unwrap()
        else {
            panic!("session missing");
        };
        assert_eq!(session.customer_id, 1);
        let Some(Record::Vehicle(vehicle)) = store.find(TENANT, EntityKind::Vehicle, 7).unwrap()
        else {
            panic!("vehicle missing");
        };
        assert_eq!(vehicle.customer_id, Some(1));
    }

    #[test]
    fn customer_remap_survives_into_later_envelopes() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (id, number, name) in [(1, "C-42", "Ada"), (500, "C-77", "Bob")] {
            let customer = Customer {
                customer_number: Some(number.to_string()),
                ..Customer::new(id, name)
            };
            store.upsert(TENANT, &Record::Customer(customer)).unwrap();
        }

        let remote = Customer {
            customer_number: Some("C-42".to_string()),
            ..Customer::new(500, "Ada")
        };
        let first = merge(
            &store,
            &ChangedData {
                customers: vec![remote],
                ..ChangedData::default()
            },
        );
        assert_eq!(first.merged + first.conflicts, 1);

        let second = merge(
            &store,
            &ChangedData {
                weighing_sessions: vec![WeighingSession::new(20, 500)],
                ..ChangedData::default()
            },
        );
        assert_eq!(second.merged, 1);

        let Some(Record::WeighingSession(session)) =
            store.find(TENANT, EntityKind::WeighingSession, 20).unwrap()
        else {
            panic!("session missing");
        };
        assert_eq!(session.customer_id, 1);

        let mut renamed = Customer::new(500, "Ada Lovelace");
        renamed.meta.updated_at = Some(chrono::Utc::now() + Duration::minutes(1));
        let third = merge(
            &store,
            &ChangedData {
                customers: vec![renamed],
                ..ChangedData::default()
            },
        );
        assert_eq!(third.merged, 1);
        assert_eq!(stored_customer(&store, 1).name, "Ada Lovelace");
        assert_eq!(stored_customer(&store, 500).name, "Bob");
    }

    #[test]
    fn remapped_child_waits_for_its_parent_across_envelopes() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_customer_alias(TENANT, 900, 3).unwrap();
        let envelope = ChangedData {
            biometric_data: vec![BiometricRecord::new(30, 900)],
            ..ChangedData::default()
        };

        assert_eq!(merge(&store, &envelope).deferred, 1);

        store
            .upsert(TENANT, &Record::Customer(Customer::new(3, "Ada")))
            .unwrap();
        let stats = merge(&store, &envelope);
        assert_eq!(stats.merged, 1);
        let Some(Record::BiometricRecord(biometric)) =
            store.find(TENANT, EntityKind::BiometricRecord, 30).unwrap()
        else {
            panic!("biometric record missing");
        };
        assert_eq!(biometric.customer_id, 3);
    }

    #[test]
    fn merge_never_touches_other_tenants() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert(TenantId(99), &Record::Customer(Customer::new(1, "Other")))
            .unwrap();

        let stats = merge(
            &store,
            &ChangedData {
                customers: vec![Customer::new(1, "Mine")],
                ..ChangedData::default()
            },
        );

        assert_eq!(stats.merged, 1);
        let Some(Record::Customer(other)) =
            store.find(TenantId(99), EntityKind::Customer, 1).unwrap()
        else {
            panic!("other tenant's customer missing");
        };
        assert_eq!(other.name, "Other");
    }

    #[test]
    fn schema_drift_is_repaired_once_and_retried() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE customers (
                tenant_id INTEGER NOT NULL,
                id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                customer_number TEXT,
                name TEXT NOT NULL,
                PRIMARY KEY (tenant_id, id)
            )",
            [],
        )
        .unwrap();
        let store = SqliteStore::from_connection(conn).unwrap();

        let stats = merge(
            &store,
            &ChangedData {
                customers: vec![Customer::new(1, "Ada"), Customer::new(2, "Grace")],
                ..ChangedData::default()
            },
        );

        assert_eq!(stats.merged, 2);
        assert!(store.capabilities().is_current());
        assert!(store.exists(TENANT, EntityKind::Customer, 2).unwrap());
    }
}
