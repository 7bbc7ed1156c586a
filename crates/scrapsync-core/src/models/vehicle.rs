//! Vehicle and metal type models

use serde::{Deserialize, Serialize};

use super::entity::{coalesce, EntityKind, Record, RecordMeta, Syncable};

/// A vehicle delivering material, optionally tied to a customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(default)]
    pub customer_id: Option<i64>,
    pub license_plate: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Vehicle {
    #[must_use]
    pub fn new(id: i64, license_plate: impl Into<String>) -> Self {
        Self {
            meta: RecordMeta::new(id),
            customer_id: None,
            license_plate: license_plate.into(),
            description: None,
        }
    }
}

impl Syncable for Vehicle {
    const KIND: EntityKind = EntityKind::Vehicle;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn absorb(&mut self, incoming: &Self) {
        self.meta.absorb(&incoming.meta);
        self.license_plate.clone_from(&incoming.license_plate);
        coalesce(&mut self.customer_id, &incoming.customer_id);
        coalesce(&mut self.description, &incoming.description);
    }

    fn into_record(self) -> Record {
        Record::Vehicle(self)
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Vehicle(vehicle) => Some(vehicle),
            _ => None,
        }
    }
}

/// A priced metal category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetalType {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub code: String,
    pub name: String,
    /// Purchase price per kilogram
    pub price_per_kg: f64,
}

impl MetalType {
    #[must_use]
    pub fn new(id: i64, code: impl Into<String>, name: impl Into<String>, price_per_kg: f64) -> Self {
        Self {
            meta: RecordMeta::new(id),
            code: code.into(),
            name: name.into(),
            price_per_kg,
        }
    }
}

impl Syncable for MetalType {
    const KIND: EntityKind = EntityKind::MetalType;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn absorb(&mut self, incoming: &Self) {
        self.meta.absorb(&incoming.meta);
        self.code.clone_from(&incoming.code);
        self.name.clone_from(&incoming.name);
        self.price_per_kg = incoming.price_per_kg;
    }

    fn into_record(self) -> Record {
        Record::MetalType(self)
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::MetalType(metal_type) => Some(metal_type),
            _ => None,
        }
    }
}
