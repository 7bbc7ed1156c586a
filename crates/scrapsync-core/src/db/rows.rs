//! Row mapping between entity structs and their tables
//!
//! Column order here must match `schema::entity_columns`.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Row;

use crate::models::{
    BiometricRecord, Customer, MetalType, Record, RecordMeta, Syncable, Vehicle, Weighing,
    WeighingSession,
};
use crate::util::{from_millis, to_millis};

pub trait SqlEntity: Syncable {
    /// Entity-specific column values in schema order
    fn values(&self) -> Vec<Value>;

    /// Build the entity from a row whose entity columns start at `offset`
    fn read(meta: RecordMeta, row: &Row<'_>, offset: usize) -> rusqlite::Result<Self>;
}

/// Entity-specific values of any record
pub fn record_values(record: &Record) -> Vec<Value> {
    match record {
        Record::Customer(customer) => customer.values(),
        Record::Vehicle(vehicle) => vehicle.values(),
        Record::MetalType(metal_type) => metal_type.values(),
        Record::WeighingSession(session) => session.values(),
        Record::Weighing(weighing) => weighing.values(),
        Record::BiometricRecord(biometric) => biometric.values(),
    }
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn opt_text(value: Option<&String>) -> Value {
    value.map_or(Value::Null, |value| Value::Text(value.clone()))
}

fn opt_int(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

fn opt_time(value: Option<DateTime<Utc>>) -> Value {
    value.map_or(Value::Null, |value| Value::Integer(to_millis(value)))
}

fn read_opt_time(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(index)?.map(from_millis))
}

impl SqlEntity for Customer {
    fn values(&self) -> Vec<Value> {
        vec![
            opt_text(self.customer_number.as_ref()),
            text(&self.name),
            opt_text(self.address.as_ref()),
            opt_text(self.phone.as_ref()),
            opt_text(self.id_document_number.as_ref()),
            opt_text(self.photo_path.as_ref()),
        ]
    }

    fn read(meta: RecordMeta, row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            meta,
            customer_number: row.get(offset)?,
            name: row.get::<_, Option<String>>(offset + 1)?.unwrap_or_default(),
            address: row.get(offset + 2)?,
            phone: row.get(offset + 3)?,
            id_document_number: row.get(offset + 4)?,
            photo_path: row.get(offset + 5)?,
        })
    }
}

impl SqlEntity for Vehicle {
    fn values(&self) -> Vec<Value> {
        vec![
            opt_int(self.customer_id),
            text(&self.license_plate),
            opt_text(self.description.as_ref()),
        ]
    }

    fn read(meta: RecordMeta, row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            meta,
            customer_id: row.get(offset)?,
            license_plate: row.get::<_, Option<String>>(offset + 1)?.unwrap_or_default(),
            description: row.get(offset + 2)?,
        })
    }
}

impl SqlEntity for MetalType {
    fn values(&self) -> Vec<Value> {
        vec![
            text(&self.code),
            text(&self.name),
            Value::Real(self.price_per_kg),
        ]
    }

    fn read(meta: RecordMeta, row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            meta,
            code: row.get::<_, Option<String>>(offset)?.unwrap_or_default(),
            name: row.get::<_, Option<String>>(offset + 1)?.unwrap_or_default(),
            price_per_kg: row.get::<_, Option<f64>>(offset + 2)?.unwrap_or_default(),
        })
    }
}

impl SqlEntity for WeighingSession {
    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.customer_id),
            opt_int(self.vehicle_id),
            text(&self.status),
            Value::Real(self.total_amount),
            opt_text(self.signature_path.as_ref()),
            opt_time(self.completed_at),
        ]
    }

    fn read(meta: RecordMeta, row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            meta,
            customer_id: row.get(offset)?,
            vehicle_id: row.get(offset + 1)?,
            status: row.get::<_, Option<String>>(offset + 2)?.unwrap_or_default(),
            total_amount: row.get::<_, Option<f64>>(offset + 3)?.unwrap_or_default(),
            signature_path: row.get(offset + 4)?,
            completed_at: read_opt_time(row, offset + 5)?,
        })
    }
}

impl SqlEntity for Weighing {
    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.session_id),
            opt_int(self.metal_type_id),
            Value::Real(self.gross_weight),
            Value::Real(self.tare_weight),
            Value::Real(self.net_weight),
            Value::Real(self.price_per_kg),
            Value::Real(self.amount),
            opt_text(self.photo_path.as_ref()),
        ]
    }

    fn read(meta: RecordMeta, row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            meta,
            session_id: row.get(offset)?,
            metal_type_id: row.get(offset + 1)?,
            gross_weight: row.get::<_, Option<f64>>(offset + 2)?.unwrap_or_default(),
            tare_weight: row.get::<_, Option<f64>>(offset + 3)?.unwrap_or_default(),
            net_weight: row.get::<_, Option<f64>>(offset + 4)?.unwrap_or_default(),
            price_per_kg: row.get::<_, Option<f64>>(offset + 5)?.unwrap_or_default(),
            amount: row.get::<_, Option<f64>>(offset + 6)?.unwrap_or_default(),
            photo_path: row.get(offset + 7)?,
        })
    }
}

impl SqlEntity for BiometricRecord {
    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.customer_id),
            opt_text(self.fingerprint_template.as_ref()),
            opt_text(self.signature_path.as_ref()),
            opt_text(self.photo_path.as_ref()),
        ]
    }

    fn read(meta: RecordMeta, row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            meta,
            customer_id: row.get(offset)?,
            fingerprint_template: row.get(offset + 1)?,
            signature_path: row.get(offset + 2)?,
            photo_path: row.get(offset + 3)?,
        })
    }
}
