use std::path::Path;
use std::time::Duration;

use scrapsync_core::config::SyncSettings;

use crate::commands::common::{format_device_lines, open_engine_with};
use crate::error::CliError;

pub fn discovery_window(timeout_secs: Option<u64>, default: Duration) -> Result<Duration, CliError> {
    match timeout_secs {
        None => Ok(default),
        Some(secs) if (1..=60).contains(&secs) => Ok(Duration::from_secs(secs)),
        Some(_) => Err(CliError::InvalidTimeout),
    }
}

pub async fn run_discover(timeout_secs: Option<u64>, db_path: &Path) -> Result<(), CliError> {
    let settings = SyncSettings::from_env()?;
    let window = discovery_window(timeout_secs, settings.discovery_window)?;
    let engine = open_engine_with(db_path, settings)?;

    println!("Listening for {} s...", window.as_secs());
    let devices = engine.discover_devices(window).await;
    for line in format_device_lines(&devices) {
        println!("{line}");
    }
    Ok(())
}
