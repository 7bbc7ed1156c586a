//! Local store for scrapsync

mod connection;
mod migrations;
mod rows;
mod schema;
mod settings_repository;
mod sqlite_store;
mod store;

pub use connection::SqliteStore;
pub use schema::{SchemaCapabilities, TableCapabilities};
pub use settings_repository::SyncCursors;
pub use store::{ChangeFilter, LocalStore, StoreAggregates, UploadReceipt};
