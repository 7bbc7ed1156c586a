//! Table layout and schema capability probing
//!
//! Older installations may carry tables that predate the sync columns. The
//! capability probe runs once per connection and the result is cached by the
//! store; only [`crate::db::LocalStore::repair_schema`] refreshes it.

use std::collections::HashMap;

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::models::EntityKind;

/// A column name with the SQL type used when creating or adding it
pub type ColumnDef = (&'static str, &'static str);

/// Sync bookkeeping columns shared by every entity table, after `tenant_id`/`id`
pub const SYNC_COLUMNS: &[ColumnDef] = &[
    ("cloud_id", "INTEGER"),
    ("created_at", "INTEGER NOT NULL DEFAULT 0"),
    ("updated_at", "INTEGER"),
    ("needs_upload", "INTEGER NOT NULL DEFAULT 1"),
];

/// Entity-specific columns, in bind order
pub const fn entity_columns(kind: EntityKind) -> &'static [ColumnDef] {
    match kind {
        EntityKind::Customer => &[
            ("customer_number", "TEXT"),
            ("name", "TEXT NOT NULL DEFAULT ''"),
            ("address", "TEXT"),
            ("phone", "TEXT"),
            ("id_document_number", "TEXT"),
            ("photo_path", "TEXT"),
        ],
        EntityKind::Vehicle => &[
            ("customer_id", "INTEGER"),
            ("license_plate", "TEXT NOT NULL DEFAULT ''"),
            ("description", "TEXT"),
        ],
        EntityKind::MetalType => &[
            ("code", "TEXT NOT NULL DEFAULT ''"),
            ("name", "TEXT NOT NULL DEFAULT ''"),
            ("price_per_kg", "REAL NOT NULL DEFAULT 0"),
        ],
        EntityKind::WeighingSession => &[
            ("customer_id", "INTEGER NOT NULL DEFAULT 0"),
            ("vehicle_id", "INTEGER"),
            ("status", "TEXT NOT NULL DEFAULT 'open'"),
            ("total_amount", "REAL NOT NULL DEFAULT 0"),
            ("signature_path", "TEXT"),
            ("completed_at", "INTEGER"),
        ],
        EntityKind::Weighing => &[
            ("session_id", "INTEGER NOT NULL DEFAULT 0"),
            ("metal_type_id", "INTEGER"),
            ("gross_weight", "REAL NOT NULL DEFAULT 0"),
            ("tare_weight", "REAL NOT NULL DEFAULT 0"),
            ("net_weight", "REAL NOT NULL DEFAULT 0"),
            ("price_per_kg", "REAL NOT NULL DEFAULT 0"),
            ("amount", "REAL NOT NULL DEFAULT 0"),
            ("photo_path", "TEXT"),
        ],
        EntityKind::BiometricRecord => &[
            ("customer_id", "INTEGER NOT NULL DEFAULT 0"),
            ("fingerprint_template", "TEXT"),
            ("signature_path", "TEXT"),
            ("photo_path", "TEXT"),
        ],
    }
}

/// `CREATE TABLE` statement for an entity table at the current schema
pub fn create_table_sql(kind: EntityKind) -> String {
    let columns = SYNC_COLUMNS
        .iter()
        .chain(entity_columns(kind))
        .map(|(name, ty)| format!("{name} {ty}"))
        .collect::<Vec<_>>()
        .join(",\n            ");
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            tenant_id INTEGER NOT NULL,
            id INTEGER NOT NULL,
            {columns},
            PRIMARY KEY (tenant_id, id)
        )",
        table = kind.table()
    )
}

/// What one entity table supports on this installation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableCapabilities {
    pub exists: bool,
    pub has_cloud_id: bool,
    pub has_updated_at: bool,
    pub has_needs_upload: bool,
    /// Expected columns absent from the table
    pub missing_columns: Vec<&'static str>,
}

/// Cached result of probing every entity table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCapabilities {
    tables: HashMap<EntityKind, TableCapabilities>,
}

impl SchemaCapabilities {
    /// Inspect every entity table with `PRAGMA table_info`
    pub fn probe(conn: &Connection) -> Result<Self> {
        let mut tables = HashMap::new();
        for kind in EntityKind::ALL {
            tables.insert(kind, probe_table(conn, kind)?);
        }
        Ok(Self { tables })
    }

    /// Capabilities of one table; a table never probed counts as missing
    pub fn table(&self, kind: EntityKind) -> TableCapabilities {
        self.tables.get(&kind).cloned().unwrap_or_default()
    }

    /// Whether every table has every expected column
    pub fn is_current(&self) -> bool {
        EntityKind::ALL.into_iter().all(|kind| {
            let table = self.table(kind);
            table.exists && table.missing_columns.is_empty()
        })
    }
}

fn probe_table(conn: &Connection, kind: EntityKind) -> Result<TableCapabilities> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", kind.table()))?;
    let present = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if present.is_empty() {
        return Ok(TableCapabilities {
            missing_columns: SYNC_COLUMNS
                .iter()
                .chain(entity_columns(kind))
                .map(|(name, _)| *name)
                .collect(),
            ..TableCapabilities::default()
        });
    }

    let has = |column: &str| present.iter().any(|name| name.eq_ignore_ascii_case(column));
    Ok(TableCapabilities {
        exists: true,
        has_cloud_id: has("cloud_id"),
        has_updated_at: has("updated_at"),
        has_needs_upload: has("needs_upload"),
        missing_columns: SYNC_COLUMNS
            .iter()
            .chain(entity_columns(kind))
            .map(|(name, _)| *name)
            .filter(|name| !has(name))
            .collect(),
    })
}

/// Bring every entity table up to the current layout.
///
/// Missing tables are created and missing columns are added; existing data is
/// left untouched.
pub fn upgrade_tables(conn: &Connection, capabilities: &SchemaCapabilities) -> Result<usize> {
    let mut changes = 0;
    for kind in EntityKind::ALL {
        let table = capabilities.table(kind);
        if !table.exists {
            conn.execute(&create_table_sql(kind), [])
                .map_err(|error| Error::classify(kind.table(), error))?;
            changes += 1;
            continue;
        }

        for missing in &table.missing_columns {
            let Some((name, ty)) = SYNC_COLUMNS
                .iter()
                .chain(entity_columns(kind))
                .find(|(name, _)| name == missing)
            else {
                continue;
            };
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {name} {ty}", kind.table()),
                [],
            )?;
            tracing::info!(table = kind.table(), column = name, "Added missing column");
            changes += 1;
        }
    }
    Ok(changes)
}
