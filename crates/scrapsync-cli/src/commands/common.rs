use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use scrapsync_core::config::SyncSettings;
use scrapsync_core::db::SqliteStore;
use scrapsync_core::models::DeviceDescriptor;
use scrapsync_core::sync::{MismatchReport, SyncEngine, SyncResult, SyncStatus};

use crate::error::CliError;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("SCRAPSYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("scrapsync")
        .join("scrapsync.db")
}

pub fn open_engine(db_path: &Path) -> Result<SyncEngine, CliError> {
    let settings = SyncSettings::from_env()?;
    open_engine_with(db_path, settings)
}

pub fn open_engine_with(db_path: &Path, settings: SyncSettings) -> Result<SyncEngine, CliError> {
    let store = SqliteStore::open(db_path)?;
    tracing::debug!(path = %db_path.display(), ?settings, "Opened local store");
    Ok(SyncEngine::new(Arc::new(store), settings)?)
}

/// Fail on an unsuccessful session; a skipped session is not an error
pub fn require_success(result: &SyncResult) -> Result<(), CliError> {
    if result.success || result.skipped {
        Ok(())
    } else {
        Err(CliError::SyncFailed(result.errors.join("; ")))
    }
}

pub fn format_result_line(result: &SyncResult) -> String {
    if result.skipped {
        return "Another sync is already running; nothing done".to_string();
    }
    let mut line = format!(
        "Sync completed via {}: {} received, {} sent",
        result.source.as_deref().unwrap_or("nowhere"),
        result.pulled,
        result.pushed
    );
    if result.conflicts > 0 {
        line.push_str(&format!(", {} kept local", result.conflicts));
    }
    if result.deferred > 0 {
        line.push_str(&format!(", {} waiting for parent records", result.deferred));
    }
    if !result.errors.is_empty() {
        line.push_str(&format!(" (partial: {})", result.errors.join("; ")));
    }
    line
}

pub fn format_mismatch_lines(report: &MismatchReport) -> Vec<String> {
    let verdict = if report.mismatched {
        "Local data differs from cloud"
    } else if report.suppressed {
        "Local data differs from cloud, ignored right after an upload"
    } else {
        "Local data matches cloud"
    };
    vec![
        verdict.to_string(),
        format!("  local:  {}", report.local_hash),
        format!(
            "  cloud:  {}",
            report.cloud_hash.as_deref().unwrap_or("unavailable")
        ),
    ]
}

pub fn format_device_lines(devices: &[DeviceDescriptor]) -> Vec<String> {
    if devices.is_empty() {
        return vec!["No devices found.".to_string()];
    }
    devices
        .iter()
        .map(|device| {
            format!(
                "{}  {}  last sync {}",
                device.id,
                device.name,
                format_timestamp(device.last_sync_time)
            )
        })
        .collect()
}

pub fn format_status_lines(status: &SyncStatus) -> Vec<String> {
    vec![
        format!("Device:          {}", status.device_name),
        format!("Tenant:          {}", status.tenant_id),
        format!(
            "Cloud sync:      {}",
            if status.cloud_enabled { "enabled" } else { "disabled" }
        ),
        format!("Last download:   {}", format_timestamp(status.last_sync_time)),
        format!("Last upload:     {}", format_timestamp(status.last_upload_time)),
        format!("Pending upload:  {}", status.pending_upload),
    ]
}

pub fn format_timestamp(value: Option<DateTime<Utc>>) -> String {
    value.map_or_else(
        || "never".to_string(),
        |value| {
            value
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        },
    )
}
