use std::path::Path;

use scrapsync_core::sync::{SyncProgress, SyncStage};
use tokio::sync::broadcast::error::RecvError;

use crate::commands::common::{format_result_line, open_engine};
use crate::error::CliError;

pub fn format_progress_line(progress: &SyncProgress) -> String {
    let stage = match progress.stage {
        SyncStage::Idle => "idle",
        SyncStage::Discovering => "discovering",
        SyncStage::Connecting => "connecting",
        SyncStage::Syncing => "syncing",
        SyncStage::Completed => "completed",
        SyncStage::Error => "error",
    };
    format!("[{stage:>11} {:>3}%] {}", progress.percent, progress.message)
}

/// Start background sync, run one session right away, then stream progress
/// until Ctrl-C
pub async fn run_background(db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let mut progress = engine.subscribe_progress();

    engine.start_background_sync().await;
    let initial = engine.clone();
    tokio::spawn(async move {
        let result = initial.perform_auto_sync().await;
        tracing::info!(summary = %format_result_line(&result), "Initial sync finished");
    });

    println!("scrapsync running as {}. Press Ctrl-C to stop.", engine.context().device_name);
    loop {
        tokio::select! {
            received = progress.recv() => match received {
                Ok(event) => println!("{}", format_progress_line(&event)),
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "Progress output fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    engine.stop_background_sync();
    println!("Stopped.");
    Ok(())
}
