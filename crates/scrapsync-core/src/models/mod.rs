//! Data models for scrapsync

mod customer;
mod device;
mod entity;
mod envelope;
mod vehicle;
mod weighing;

pub use customer::{Customer, CustomerKey};
pub use device::DeviceDescriptor;
pub use entity::{EntityKind, Record, RecordMeta, Syncable, TenantId};
pub use envelope::ChangedData;
pub use vehicle::{MetalType, Vehicle};
pub use weighing::{BiometricRecord, Weighing, WeighingSession};
