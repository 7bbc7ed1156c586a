//! Changed-data envelope exchanged with peers and the cloud

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{EntityKind, Record};
use super::{BiometricRecord, Customer, MetalType, Vehicle, Weighing, WeighingSession};

/// Per-kind lists of records that changed since a cursor (or are pending upload)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedData {
    #[serde(default)]
    pub customers: Vec<Customer>,
    #[serde(default)]
    pub weighing_sessions: Vec<WeighingSession>,
    #[serde(default)]
    pub weighings: Vec<Weighing>,
    #[serde(default)]
    pub biometric_data: Vec<BiometricRecord>,
    #[serde(default)]
    pub vehicles: Vec<Vehicle>,
    #[serde(default)]
    pub metal_types: Vec<MetalType>,
    /// When the sender captured this envelope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl ChangedData {
    /// Number of records of one kind
    #[must_use]
    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Customer => self.customers.len(),
            EntityKind::Vehicle => self.vehicles.len(),
            EntityKind::MetalType => self.metal_types.len(),
            EntityKind::WeighingSession => self.weighing_sessions.len(),
            EntityKind::Weighing => self.weighings.len(),
            EntityKind::BiometricRecord => self.biometric_data.len(),
        }
    }

    /// Record count across all kinds
    #[must_use]
    pub fn total_records(&self) -> usize {
        EntityKind::ALL.into_iter().map(|kind| self.count(kind)).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_records() == 0
    }

    /// Append a record to the list matching its kind
    pub fn push(&mut self, record: Record) {
        match record {
            Record::Customer(customer) => self.customers.push(customer),
            Record::Vehicle(vehicle) => self.vehicles.push(vehicle),
            Record::MetalType(metal_type) => self.metal_types.push(metal_type),
            Record::WeighingSession(session) => self.weighing_sessions.push(session),
            Record::Weighing(weighing) => self.weighings.push(weighing),
            Record::BiometricRecord(biometric) => self.biometric_data.push(biometric),
        }
    }

    /// All records, parents first
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        let mut records = Vec::with_capacity(self.total_records());
        records.extend(self.customers.iter().cloned().map(Record::Customer));
        records.extend(self.vehicles.iter().cloned().map(Record::Vehicle));
        records.extend(self.metal_types.iter().cloned().map(Record::MetalType));
        records.extend(
            self.weighing_sessions
                .iter()
                .cloned()
                .map(Record::WeighingSession),
        );
        records.extend(self.weighings.iter().cloned().map(Record::Weighing));
        records.extend(
            self.biometric_data
                .iter()
                .cloned()
                .map(Record::BiometricRecord),
        );
        records
    }

    /// Split into single-kind envelopes of at most `batch_size` records each.
    ///
    /// Kinds without records produce no batches; every other list in a batch is empty.
    #[must_use]
    pub fn split_batches(&self, batch_size: usize) -> Vec<(EntityKind, Self)> {
        let batch_size = batch_size.max(1);
        let empty = Self {
            captured_at: self.captured_at,
            ..Self::default()
        };
        let mut batches = Vec::new();

        for kind in EntityKind::ALL {
            match kind {
                EntityKind::Customer => {
                    empty.chunk_into(&mut batches, kind, &self.customers, batch_size, |data| {
                        &mut data.customers
                    });
                }
                EntityKind::Vehicle => {
                    empty.chunk_into(&mut batches, kind, &self.vehicles, batch_size, |data| {
                        &mut data.vehicles
                    });
                }
                EntityKind::MetalType => {
                    empty.chunk_into(&mut batches, kind, &self.metal_types, batch_size, |data| {
                        &mut data.metal_types
                    });
                }
                EntityKind::WeighingSession => {
                    empty.chunk_into(
                        &mut batches,
                        kind,
                        &self.weighing_sessions,
                        batch_size,
                        |data| &mut data.weighing_sessions,
                    );
                }
                EntityKind::Weighing => {
                    empty.chunk_into(&mut batches, kind, &self.weighings, batch_size, |data| {
                        &mut data.weighings
                    });
                }
                EntityKind::BiometricRecord => {
                    empty.chunk_into(
                        &mut batches,
                        kind,
                        &self.biometric_data,
                        batch_size,
                        |data| &mut data.biometric_data,
                    );
                }
            }
        }

        batches
    }

    /// Append one batch per `batch_size` slice of `items`, each a copy of this
    /// (empty) envelope with the slice in the list `slot` selects
    fn chunk_into<T: Clone>(
        &self,
        batches: &mut Vec<(EntityKind, Self)>,
        kind: EntityKind,
        items: &[T],
        batch_size: usize,
        slot: fn(&mut Self) -> &mut Vec<T>,
    ) {
        for chunk in items.chunks(batch_size) {
            let mut batch = self.clone();
            slot(&mut batch).extend_from_slice(chunk);
            batches.push((kind, batch));
        }
    }
}
