//! Customer model

use serde::{Deserialize, Serialize};

use super::entity::{coalesce, EntityKind, Record, RecordMeta, Syncable};

/// A customer selling material at the scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(default)]
    pub customer_number: Option<String>,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub id_document_number: Option<String>,
    #[serde(default)]
    pub photo_path: Option<String>,
}

/// Business key used to recognise the same customer created on two devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerKey {
    Number(String),
    NameAddress { name: String, address: String },
}

impl Customer {
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            meta: RecordMeta::new(id),
            customer_number: None,
            name: name.into(),
            address: None,
            phone: None,
            id_document_number: None,
            photo_path: None,
        }
    }

    /// `customer_number` when set, otherwise the `name + address` pair
    #[must_use]
    pub fn business_key(&self) -> Option<CustomerKey> {
        if let Some(number) = self
            .customer_number
            .as_deref()
            .map(str::trim)
            .filter(|number| !number.is_empty())
        {
            return Some(CustomerKey::Number(number.to_string()));
        }

        let name = self.name.trim();
        let address = self.address.as_deref().map(str::trim).unwrap_or_default();
        if name.is_empty() || address.is_empty() {
            return None;
        }
        Some(CustomerKey::NameAddress {
            name: name.to_string(),
            address: address.to_string(),
        })
    }
}

impl Syncable for Customer {
    const KIND: EntityKind = EntityKind::Customer;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn absorb(&mut self, incoming: &Self) {
        self.meta.absorb(&incoming.meta);
        self.name.clone_from(&incoming.name);
        coalesce(&mut self.customer_number, &incoming.customer_number);
        coalesce(&mut self.address, &incoming.address);
        coalesce(&mut self.phone, &incoming.phone);
        coalesce(&mut self.id_document_number, &incoming.id_document_number);
        coalesce(&mut self.photo_path, &incoming.photo_path);
    }

    fn into_record(self) -> Record {
        Record::Customer(self)
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Customer(customer) => Some(customer),
            _ => None,
        }
    }
}
