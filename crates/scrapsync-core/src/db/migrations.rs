//! Database migrations

use rusqlite::Connection;

use super::schema::create_table_sql;
use crate::error::Result;
use crate::models::EntityKind;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn apply(conn: &Connection, statements: &[String]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.commit()?;
    Ok(())
}

/// Migration to version 1: entity tables and tenant-scoped settings.
///
/// Tables that already exist (older installations) are left as they are; the
/// schema capability probe reports what they lack.
fn migrate_v1(conn: &Connection) -> Result<()> {
    let mut statements = vec!["CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )"
    .to_string()];
    statements.extend(EntityKind::ALL.into_iter().map(create_table_sql));
    statements.push(
        "CREATE TABLE IF NOT EXISTS settings (
            tenant_id INTEGER NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (tenant_id, key)
        )"
        .to_string(),
    );
    statements.push("INSERT INTO schema_version (version) VALUES (1)".to_string());

    apply(conn, &statements)?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: parent lookup indexes used by the merge engine
fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE INDEX IF NOT EXISTS idx_weighings_session ON weighings(tenant_id, session_id)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_customer ON weighing_sessions(tenant_id, customer_id)",
        "CREATE INDEX IF NOT EXISTS idx_biometric_customer ON biometric_data(tenant_id, customer_id)",
        "CREATE INDEX IF NOT EXISTS idx_customers_number ON customers(tenant_id, customer_number)",
        "INSERT INTO schema_version (version) VALUES (2)",
    ]
    .map(str::to_string);

    apply(conn, &statements)?;
    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: remote customer ids matched to a local customer by
/// business key
fn migrate_v3(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS customer_id_map (
            tenant_id INTEGER NOT NULL,
            remote_id INTEGER NOT NULL,
            local_id INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, remote_id)
        )",
        "INSERT INTO schema_version (version) VALUES (3)",
    ]
    .map(str::to_string);

    apply(conn, &statements)?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = setup();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = setup();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migration_v1_creates_entity_tables() {
        let conn = setup();
        run(&conn).unwrap();

        for kind in EntityKind::ALL {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
                    [kind.table()],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "missing table {}", kind.table());
        }
    }

    #[test]
    fn test_migration_v3_creates_customer_id_map() {
        let conn = setup();
        run(&conn).unwrap();

        conn.execute(
            "INSERT INTO customer_id_map (tenant_id, remote_id, local_id) VALUES (1, 500, 1)",
            [],
        )
        .unwrap();
        let local: i64 = conn
            .query_row(
                "SELECT local_id FROM customer_id_map WHERE tenant_id = 1 AND remote_id = 500",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(local, 1);
    }
}
