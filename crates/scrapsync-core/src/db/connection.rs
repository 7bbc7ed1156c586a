//! Database connection management

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use rusqlite::Connection;

use super::migrations;
use super::schema::SchemaCapabilities;
use crate::error::{Error, Result};

/// `SQLite`-backed local store.
///
/// The connection is guarded by a mutex; every store call is short and
/// synchronous. Schema capabilities are probed once when the store is opened.
pub struct SqliteStore {
    pub(super) conn: Mutex<Connection>,
    pub(super) capabilities: RwLock<SchemaCapabilities>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open a store at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open an in-memory store (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    /// Wrap an existing connection, e.g. one holding tables from an older installation
    pub fn from_connection(conn: Connection) -> Result<Self> {
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        Self::configure(&conn)?;
        migrations::run(&conn)?;

        let capabilities = SchemaCapabilities::probe(&conn)?;
        if !capabilities.is_current() {
            tracing::warn!("Local schema predates sync columns; running in compatibility mode");
        }

        Ok(Self {
            conn: Mutex::new(conn),
            capabilities: RwLock::new(capabilities),
            path,
        })
    }

    /// Configure `SQLite` for concurrent readers
    fn configure(conn: &Connection) -> Result<()> {
        // In-memory databases reject WAL; that is fine.
        conn.execute_batch("PRAGMA journal_mode = WAL;").ok();
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }

    /// Path of the backing file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(super) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("connection lock poisoned".to_string()))
    }

    pub(super) fn cached_capabilities(&self) -> SchemaCapabilities {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
