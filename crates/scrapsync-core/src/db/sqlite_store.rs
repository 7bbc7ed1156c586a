//! `LocalStore` implementation over `SQLite`

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::connection::SqliteStore;
use super::rows::{record_values, SqlEntity};
use super::schema::{entity_columns, upgrade_tables, SchemaCapabilities, TableCapabilities};
use super::store::{ChangeFilter, LocalStore, StoreAggregates, UploadReceipt};
use crate::error::{Error, Result};
use crate::models::{
    BiometricRecord, ChangedData, Customer, CustomerKey, EntityKind, MetalType, Record,
    RecordMeta, Syncable, TenantId, Vehicle, Weighing, WeighingSession,
};
use crate::util::{from_millis, to_millis};

/// Leading meta columns in every entity `SELECT`
const META_COLUMNS: usize = 5;

fn select_clause(kind: EntityKind, table: &TableCapabilities) -> String {
    let cloud_id = if table.has_cloud_id { "cloud_id" } else { "NULL" };
    let updated_at = if table.has_updated_at { "updated_at" } else { "NULL" };
    let needs_upload = if table.has_needs_upload { "needs_upload" } else { "0" };
    let columns = entity_columns(kind)
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT id, {cloud_id}, created_at, {updated_at}, {needs_upload}, {columns} FROM {}",
        kind.table()
    )
}

/// SQL expression for a row's effective modification time
const fn effective_time(table: &TableCapabilities) -> &'static str {
    if table.has_updated_at {
        "COALESCE(updated_at, created_at)"
    } else {
        "created_at"
    }
}

fn read_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordMeta> {
    Ok(RecordMeta {
        id: row.get(0)?,
        cloud_id: row.get(1)?,
        created_at: from_millis(row.get::<_, Option<i64>>(2)?.unwrap_or_default()),
        updated_at: row.get::<_, Option<i64>>(3)?.map(from_millis),
        needs_upload: row.get::<_, Option<i64>>(4)?.unwrap_or_default() != 0,
    })
}

fn query_records<T: SqlEntity>(
    conn: &Connection,
    table: &TableCapabilities,
    condition: &str,
    values: Vec<Value>,
) -> Result<Vec<T>> {
    let kind = T::KIND;
    let sql = format!("{} WHERE {condition} ORDER BY id", select_clause(kind, table));
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|error| Error::classify(kind.table(), error))?;
    let records = stmt
        .query_map(params_from_iter(values), |row| {
            T::read(read_meta(row)?, row, META_COLUMNS)
        })
        .map_err(|error| Error::classify(kind.table(), error))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|error| Error::classify(kind.table(), error))?;
    Ok(records)
}

impl SqliteStore {
    fn changed<T: SqlEntity>(
        conn: &Connection,
        capabilities: &SchemaCapabilities,
        tenant: TenantId,
        filter: ChangeFilter,
    ) -> Result<Vec<T>> {
        let table = capabilities.table(T::KIND);
        if !table.exists {
            tracing::debug!(table = T::KIND.table(), "Skipping missing table");
            return Ok(Vec::new());
        }

        let tenant_value = Value::Integer(tenant.get());
        let since_condition = |since: DateTime<Utc>| {
            (
                format!("tenant_id = ? AND {} > ?", effective_time(&table)),
                vec![tenant_value.clone(), Value::Integer(to_millis(since))],
            )
        };

        let (condition, values) = match filter {
            ChangeFilter::PendingUpload { .. } if table.has_needs_upload => (
                "tenant_id = ? AND needs_upload = 1".to_string(),
                vec![tenant_value.clone()],
            ),
            ChangeFilter::PendingUpload { since: Some(since) } | ChangeFilter::Since(since) => {
                since_condition(since)
            }
            ChangeFilter::PendingUpload { since: None } | ChangeFilter::All => {
                ("tenant_id = ?".to_string(), vec![tenant_value.clone()])
            }
        };

        query_records::<T>(conn, &table, &condition, values)
    }

    fn find_typed<T: SqlEntity>(
        conn: &Connection,
        capabilities: &SchemaCapabilities,
        tenant: TenantId,
        id: i64,
    ) -> Result<Option<Record>> {
        let table = capabilities.table(T::KIND);
        let mut found = query_records::<T>(
            conn,
            &table,
            "tenant_id = ? AND id = ?",
            vec![Value::Integer(tenant.get()), Value::Integer(id)],
        )?;
        Ok(found.pop().map(Syncable::into_record))
    }
}

impl LocalStore for SqliteStore {
    fn capabilities(&self) -> SchemaCapabilities {
        self.cached_capabilities()
    }

    fn list_changed(&self, tenant: TenantId, filter: ChangeFilter) -> Result<ChangedData> {
        let captured_at = crate::util::now_millis();
        let conn = self.lock()?;
        let capabilities = self.cached_capabilities();

        Ok(ChangedData {
            customers: Self::changed::<Customer>(&conn, &capabilities, tenant, filter)?,
            weighing_sessions: Self::changed::<WeighingSession>(
                &conn,
                &capabilities,
                tenant,
                filter,
            )?,
            weighings: Self::changed::<Weighing>(&conn, &capabilities, tenant, filter)?,
            biometric_data: Self::changed::<BiometricRecord>(&conn, &capabilities, tenant, filter)?,
            vehicles: Self::changed::<Vehicle>(&conn, &capabilities, tenant, filter)?,
            metal_types: Self::changed::<MetalType>(&conn, &capabilities, tenant, filter)?,
            captured_at: Some(captured_at),
        })
    }

    fn find(&self, tenant: TenantId, kind: EntityKind, id: i64) -> Result<Option<Record>> {
        let conn = self.lock()?;
        let capabilities = self.cached_capabilities();
        match kind {
            EntityKind::Customer => Self::find_typed::<Customer>(&conn, &capabilities, tenant, id),
            EntityKind::Vehicle => Self::find_typed::<Vehicle>(&conn, &capabilities, tenant, id),
            EntityKind::MetalType => {
                Self::find_typed::<MetalType>(&conn, &capabilities, tenant, id)
            }
            EntityKind::WeighingSession => {
                Self::find_typed::<WeighingSession>(&conn, &capabilities, tenant, id)
            }
            EntityKind::Weighing => Self::find_typed::<Weighing>(&conn, &capabilities, tenant, id),
            EntityKind::BiometricRecord => {
                Self::find_typed::<BiometricRecord>(&conn, &capabilities, tenant, id)
            }
        }
    }

    fn find_customer_by_business_key(
        &self,
        tenant: TenantId,
        key: &CustomerKey,
    ) -> Result<Option<Customer>> {
        let conn = self.lock()?;
        let table = self.cached_capabilities().table(EntityKind::Customer);
        let (condition, values) = match key {
            CustomerKey::Number(number) => (
                "tenant_id = ? AND TRIM(customer_number) = ?",
                vec![Value::Integer(tenant.get()), Value::Text(number.clone())],
            ),
            CustomerKey::NameAddress { name, address } => (
                "tenant_id = ? AND TRIM(name) = ? AND TRIM(address) = ?",
                vec![
                    Value::Integer(tenant.get()),
                    Value::Text(name.clone()),
                    Value::Text(address.clone()),
                ],
            ),
        };
        let found = query_records::<Customer>(&conn, &table, condition, values)?;
        Ok(found.into_iter().next())
    }

    fn exists(&self, tenant: TenantId, kind: EntityKind, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE tenant_id = ? AND id = ?)",
                kind.table()
            ),
            params![tenant.get(), id],
            |row| row.get(0),
        )
        .map_err(|error| Error::classify(kind.table(), error))
    }

    fn upsert(&self, tenant: TenantId, record: &Record) -> Result<()> {
        let kind = record.kind();
        let meta = record.meta();
        let table = self.cached_capabilities().table(kind);

        let mut columns = vec!["tenant_id", "id"];
        let mut values = vec![Value::Integer(tenant.get()), Value::Integer(meta.id)];
        if table.has_cloud_id {
            columns.push("cloud_id");
            values.push(meta.cloud_id.map_or(Value::Null, Value::Integer));
        }
        columns.push("created_at");
        values.push(Value::Integer(to_millis(meta.created_at)));
        if table.has_updated_at {
            columns.push("updated_at");
            values.push(
                meta.updated_at
                    .map_or(Value::Null, |updated_at| Value::Integer(to_millis(updated_at))),
            );
        }
        if table.has_needs_upload {
            columns.push("needs_upload");
            values.push(Value::Integer(i64::from(meta.needs_upload)));
        }
        columns.extend(entity_columns(kind).iter().map(|(name, _)| *name));
        values.extend(record_values(record));

        let placeholders = vec!["?"; columns.len()].join(", ");
        let assignments = columns
            .iter()
            .skip(2)
            .map(|column| {
                if *column == "cloud_id" {
                    format!("cloud_id = COALESCE({}.cloud_id, excluded.cloud_id)", kind.table())
                } else {
                    format!("{column} = excluded.{column}")
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {table} ({columns}) VALUES ({placeholders})
             ON CONFLICT(tenant_id, id) DO UPDATE SET {assignments}",
            table = kind.table(),
            columns = columns.join(", "),
        );

        let conn = self.lock()?;
        conn.execute(&sql, params_from_iter(values))
            .map_err(|error| Error::classify(kind.table(), error))?;
        Ok(())
    }

    fn mark_uploaded(&self, tenant: TenantId, receipt: &UploadReceipt) -> Result<bool> {
        let table = self.cached_capabilities().table(receipt.kind);
        let mut assignments = Vec::new();
        let mut values = Vec::new();
        if table.has_needs_upload {
            assignments.push("needs_upload = 0");
        }
        if table.has_cloud_id {
            assignments.push("cloud_id = COALESCE(cloud_id, ?)");
            values.push(receipt.cloud_id.map_or(Value::Null, Value::Integer));
        }
        if assignments.is_empty() {
            return Ok(true);
        }
        values.extend([
            Value::Integer(tenant.get()),
            Value::Integer(receipt.id),
            Value::Integer(to_millis(receipt.pushed_version)),
        ]);

        let sql = format!(
            "UPDATE {} SET {} WHERE tenant_id = ? AND id = ? AND {} = ?",
            receipt.kind.table(),
            assignments.join(", "),
            effective_time(&table),
        );
        let conn = self.lock()?;
        let rows = conn
            .execute(&sql, params_from_iter(values))
            .map_err(|error| Error::classify(receipt.kind.table(), error))?;
        Ok(rows > 0)
    }

    fn aggregates(&self, tenant: TenantId) -> Result<StoreAggregates> {
        let conn = self.lock()?;
        let capabilities = self.cached_capabilities();
        let mut aggregates = StoreAggregates::default();

        let scalar = |sql: String, table: &str| -> Result<i64> {
            conn.query_row(&sql, params![tenant.get()], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .map(Option::unwrap_or_default)
            .map_err(|error| Error::classify(table, error))
        };

        for kind in EntityKind::ALL {
            if !capabilities.table(kind).exists {
                aggregates.counts.push((kind, 0));
                continue;
            }
            let table = kind.table();
            let count = scalar(format!("SELECT COUNT(*) FROM {table} WHERE tenant_id = ?"), table)?;
            aggregates.counts.push((kind, count));
            aggregates.id_sum += scalar(
                format!("SELECT SUM(id) FROM {table} WHERE tenant_id = ?"),
                table,
            )?;

            match kind {
                EntityKind::Customer | EntityKind::MetalType => {
                    aggregates.named_count += scalar(
                        format!(
                            "SELECT COUNT(*) FROM {table} WHERE tenant_id = ? AND TRIM(COALESCE(name, '')) <> ''"
                        ),
                        table,
                    )?;
                }
                EntityKind::Weighing => {
                    aggregates.weight_sum += scalar(
                        format!(
                            "SELECT SUM(CAST(net_weight AS INTEGER)) FROM {table} WHERE tenant_id = ?"
                        ),
                        table,
                    )?;
                    aggregates.amount_sum += scalar(
                        format!("SELECT SUM(CAST(amount AS INTEGER)) FROM {table} WHERE tenant_id = ?"),
                        table,
                    )?;
                }
                EntityKind::WeighingSession => {
                    aggregates.amount_sum += scalar(
                        format!(
                            "SELECT SUM(CAST(total_amount AS INTEGER)) FROM {table} WHERE tenant_id = ?"
                        ),
                        table,
                    )?;
                }
                EntityKind::Vehicle | EntityKind::BiometricRecord => {}
            }
        }

        Ok(aggregates)
    }

    fn latest_change(&self, tenant: TenantId) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let capabilities = self.cached_capabilities();
        let mut latest: Option<i64> = None;

        for kind in EntityKind::ALL {
            let table = capabilities.table(kind);
            if !table.exists {
                continue;
            }
            let value: Option<i64> = conn
                .query_row(
                    &format!(
                        "SELECT MAX({}) FROM {} WHERE tenant_id = ?",
                        effective_time(&table),
                        kind.table()
                    ),
                    params![tenant.get()],
                    |row| row.get(0),
                )
                .map_err(|error| Error::classify(kind.table(), error))?;
            latest = latest.max(value);
        }

        Ok(latest.map(from_millis))
    }

    fn save_customer_alias(&self, tenant: TenantId, remote_id: i64, local_id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO customer_id_map (tenant_id, remote_id, local_id) VALUES (?, ?, ?)",
            params![tenant.get(), remote_id, local_id],
        )?;
        Ok(())
    }

    fn customer_alias(&self, tenant: TenantId, remote_id: i64) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let local_id = conn
            .query_row(
                "SELECT local_id FROM customer_id_map WHERE tenant_id = ? AND remote_id = ?",
                params![tenant.get(), remote_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(local_id)
    }

    fn load_setting(&self, tenant: TenantId, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE tenant_id = ? AND key = ?",
                params![tenant.get(), key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn save_setting(&self, tenant: TenantId, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (tenant_id, key, value) VALUES (?, ?, ?)",
            params![tenant.get(), key, value],
        )?;
        Ok(())
    }

    fn repair_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        let before = SchemaCapabilities::probe(&conn)?;
        let changes = upgrade_tables(&conn, &before)?;
        let after = SchemaCapabilities::probe(&conn)?;
        tracing::info!(changes, current = after.is_current(), "Repaired local schema");

        let mut cached = self
            .capabilities
            .write()
            .map_err(|_| Error::Database("capability cache poisoned".to_string()))?;
        *cached = after;
        Ok(())
    }
}
