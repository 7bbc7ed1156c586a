//! Weighing session, weighing and biometric models
//!
//! These are the child entities: each one references a parent that has to be
//! present locally before the record can be inserted by a merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{coalesce, EntityKind, Record, RecordMeta, Syncable};

/// One visit of a customer to the scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeighingSession {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub customer_id: i64,
    #[serde(default)]
    pub vehicle_id: Option<i64>,
    pub status: String,
    #[serde(default)]
    pub total_amount: f64,
    #[serde(default)]
    pub signature_path: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WeighingSession {
    #[must_use]
    pub fn new(id: i64, customer_id: i64) -> Self {
        Self {
            meta: RecordMeta::new(id),
            customer_id,
            vehicle_id: None,
            status: "open".to_string(),
            total_amount: 0.0,
            signature_path: None,
            completed_at: None,
        }
    }
}

impl Syncable for WeighingSession {
    const KIND: EntityKind = EntityKind::WeighingSession;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn parent(&self) -> Option<(EntityKind, i64)> {
        Some((EntityKind::Customer, self.customer_id))
    }

    fn absorb(&mut self, incoming: &Self) {
        self.meta.absorb(&incoming.meta);
        self.customer_id = incoming.customer_id;
        self.status.clone_from(&incoming.status);
        self.total_amount = incoming.total_amount;
        coalesce(&mut self.vehicle_id, &incoming.vehicle_id);
        coalesce(&mut self.signature_path, &incoming.signature_path);
        coalesce(&mut self.completed_at, &incoming.completed_at);
    }

    fn into_record(self) -> Record {
        Record::WeighingSession(self)
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::WeighingSession(session) => Some(session),
            _ => None,
        }
    }
}

/// A single weighed lot inside a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Weighing {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub session_id: i64,
    #[serde(default)]
    pub metal_type_id: Option<i64>,
    pub gross_weight: f64,
    pub tare_weight: f64,
    pub net_weight: f64,
    pub price_per_kg: f64,
    pub amount: f64,
    #[serde(default)]
    pub photo_path: Option<String>,
}

impl Weighing {
    /// A weighing with the net weight and amount derived from its inputs
    #[must_use]
    pub fn new(id: i64, session_id: i64, gross_weight: f64, tare_weight: f64, price_per_kg: f64) -> Self {
        let net_weight = (gross_weight - tare_weight).max(0.0);
        Self {
            meta: RecordMeta::new(id),
            session_id,
            metal_type_id: None,
            gross_weight,
            tare_weight,
            net_weight,
            price_per_kg,
            amount: net_weight * price_per_kg,
            photo_path: None,
        }
    }
}

impl Syncable for Weighing {
    const KIND: EntityKind = EntityKind::Weighing;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn parent(&self) -> Option<(EntityKind, i64)> {
        Some((EntityKind::WeighingSession, self.session_id))
    }

    fn absorb(&mut self, incoming: &Self) {
        self.meta.absorb(&incoming.meta);
        self.session_id = incoming.session_id;
        self.gross_weight = incoming.gross_weight;
        self.tare_weight = incoming.tare_weight;
        self.net_weight = incoming.net_weight;
        self.price_per_kg = incoming.price_per_kg;
        self.amount = incoming.amount;
        coalesce(&mut self.metal_type_id, &incoming.metal_type_id);
        coalesce(&mut self.photo_path, &incoming.photo_path);
    }

    fn into_record(self) -> Record {
        Record::Weighing(self)
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Weighing(weighing) => Some(weighing),
            _ => None,
        }
    }
}

/// Fingerprint, signature and photo captured for a customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiometricRecord {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub customer_id: i64,
    /// Base64 encoded template as produced by the capture device
    #[serde(default)]
    pub fingerprint_template: Option<String>,
    #[serde(default)]
    pub signature_path: Option<String>,
    #[serde(default)]
    pub photo_path: Option<String>,
}

impl BiometricRecord {
    #[must_use]
    pub fn new(id: i64, customer_id: i64) -> Self {
        Self {
            meta: RecordMeta::new(id),
            customer_id,
            fingerprint_template: None,
            signature_path: None,
            photo_path: None,
        }
    }
}

impl Syncable for BiometricRecord {
    const KIND: EntityKind = EntityKind::BiometricRecord;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn parent(&self) -> Option<(EntityKind, i64)> {
        Some((EntityKind::Customer, self.customer_id))
    }

    fn absorb(&mut self, incoming: &Self) {
        self.meta.absorb(&incoming.meta);
        self.customer_id = incoming.customer_id;
        coalesce(&mut self.fingerprint_template, &incoming.fingerprint_template);
        coalesce(&mut self.signature_path, &incoming.signature_path);
        coalesce(&mut self.photo_path, &incoming.photo_path);
    }

    fn into_record(self) -> Record {
        Record::BiometricRecord(self)
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::BiometricRecord(record) => Some(record),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighing_derives_net_weight_and_amount() {
        let weighing = Weighing::new(1, 1, 1_250.0, 250.0, 0.5);
        assert!((weighing.net_weight - 1_000.0).abs() < f64::EPSILON);
        assert!((weighing.amount - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn children_report_their_parents() {
        assert_eq!(
            Weighing::new(1, 9, 10.0, 1.0, 1.0).parent(),
            Some((EntityKind::WeighingSession, 9))
        );
        assert_eq!(
            BiometricRecord::new(1, 4).parent(),
            Some((EntityKind::Customer, 4))
        );
    }

    #[test]
    fn session_absorb_coalesces_signature() {
        let mut local = WeighingSession {
            signature_path: Some("sig/1.png".to_string()),
            ..WeighingSession::new(1, 2)
        };
        let remote = WeighingSession {
            status: "completed".to_string(),
            total_amount: 42.5,
            ..WeighingSession::new(1, 2)
        };
        local.absorb(&remote);
        assert_eq!(local.status, "completed");
        assert_eq!(local.signature_path.as_deref(), Some("sig/1.png"));
    }
}
