use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use pretty_assertions::assert_eq;
use scrapsync_core::config::SyncSettings;
use scrapsync_core::models::{DeviceDescriptor, TenantId};
use scrapsync_core::sync::{MismatchReport, SyncProgress, SyncResult, SyncStage};

use crate::cli::{Cli, Commands};
use crate::commands::common::{
    format_device_lines, format_mismatch_lines, format_result_line, format_status_lines,
    format_timestamp, open_engine_with, require_success, resolve_db_path,
};
use crate::commands::discover::discovery_window;
use crate::commands::run::format_progress_line;
use crate::error::CliError;

#[test]
fn parses_download_full_with_global_db_path() {
    let cli = Cli::try_parse_from(["scrapsync", "download", "--full", "--db-path", "/tmp/s.db"])
        .unwrap();
    assert!(matches!(cli.command, Commands::Download { full: true }));
    assert_eq!(resolve_db_path(cli.db_path).to_str(), Some("/tmp/s.db"));
}

#[test]
fn parses_discover_timeout_and_status_json() {
    let cli = Cli::try_parse_from(["scrapsync", "discover", "--timeout", "5"]).unwrap();
    assert!(matches!(cli.command, Commands::Discover { timeout: Some(5) }));

    let cli = Cli::try_parse_from(["scrapsync", "status", "--json"]).unwrap();
    assert!(matches!(cli.command, Commands::Status { json: true }));
}

#[test]
fn subcommand_is_required() {
    assert!(Cli::try_parse_from(["scrapsync"]).is_err());
}

#[test]
fn discovery_window_validates_range() {
    let default = Duration::from_secs(3);
    assert_eq!(discovery_window(None, default).unwrap(), default);
    assert_eq!(discovery_window(Some(10), default).unwrap(), Duration::from_secs(10));
    assert!(matches!(
        discovery_window(Some(0), default),
        Err(CliError::InvalidTimeout)
    ));
    assert!(discovery_window(Some(61), default).is_err());
}

#[test]
fn skipped_sessions_are_not_errors() {
    assert!(require_success(&SyncResult::skipped()).is_ok());
    assert!(require_success(&SyncResult::success()).is_ok());

    let error = require_success(&SyncResult::failure("cloud unreachable")).unwrap_err();
    assert_eq!(error.to_string(), "Sync failed: cloud unreachable");
}

#[test]
fn result_line_mentions_conflicts_and_partial_errors() {
    let result = SyncResult {
        source: Some("cloud".to_string()),
        pulled: 4,
        pushed: 2,
        conflicts: 1,
        errors: vec!["upload timed out".to_string()],
        ..SyncResult::success()
    };
    assert_eq!(
        format_result_line(&result),
        "Sync completed via cloud: 4 received, 2 sent, 1 kept local (partial: upload timed out)"
    );
    assert_eq!(
        format_result_line(&SyncResult::skipped()),
        "Another sync is already running; nothing done"
    );
}

#[test]
fn mismatch_lines_show_unavailable_cloud_hash() {
    let report = MismatchReport {
        mismatched: true,
        local_hash: "abc".to_string(),
        cloud_hash: None,
        suppressed: false,
    };
    let lines = format_mismatch_lines(&report);
    assert_eq!(lines[0], "Local data differs from cloud");
    assert_eq!(lines[2], "  cloud:  unavailable");
}

#[test]
fn device_lines_handle_empty_and_found_devices() {
    assert_eq!(format_device_lines(&[]), vec!["No devices found.".to_string()]);

    let device = DeviceDescriptor::new(
        "192.168.1.9:8765".parse().unwrap(),
        "scale-2",
        TenantId(7),
        None,
    );
    let lines = format_device_lines(&[device]);
    assert_eq!(lines, vec!["192.168.1.9:8765  scale-2  last sync never".to_string()]);
}

#[test]
fn progress_line_pads_stage_and_percent() {
    let line = format_progress_line(&SyncProgress {
        stage: SyncStage::Syncing,
        percent: 40,
        message: "Downloading changes from cloud".to_string(),
    });
    assert_eq!(line, "[    syncing  40%] Downloading changes from cloud");
}

#[test]
fn timestamps_render_never_when_missing() {
    assert_eq!(format_timestamp(None), "never");
    assert_eq!(format_timestamp(Some(Utc::now())).len(), 19);
}

#[test]
fn status_of_fresh_database_has_nothing_pending() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("scrapsync.db");
    let settings = SyncSettings {
        device_name: "scale-1".to_string(),
        ..SyncSettings::new(TenantId(7))
    };

    let engine = open_engine_with(&db_path, settings).unwrap();
    let status = engine.status().unwrap();

    assert!(db_path.exists());
    assert_eq!(status.pending_upload, 0);
    assert!(!status.cloud_enabled);
    let lines = format_status_lines(&status);
    assert_eq!(lines[0], "Device:          scale-1");
    assert_eq!(lines[3], "Last download:   never");
}
