//! scrapsync-core - Core library for scrapsync
//!
//! This crate contains the entity models, the `SQLite` local store, and the
//! sync engine that keeps weighing stations of one installation consistent
//! with each other over the LAN and with the cloud store.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{ChangedData, TenantId};
