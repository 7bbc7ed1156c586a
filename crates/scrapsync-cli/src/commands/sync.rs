use std::path::Path;

use crate::commands::common::{format_result_line, open_engine, require_success};
use crate::error::CliError;

pub async fn run_sync(db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let result = engine.perform_auto_sync().await;
    require_success(&result)?;
    println!("{}", format_result_line(&result));
    Ok(())
}

pub async fn run_upload(db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let result = engine.upload_only().await;
    require_success(&result)?;
    println!("Uploaded {} records", result.pushed);
    Ok(())
}

pub async fn run_download(full: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let result = engine.download_only(full).await;
    require_success(&result)?;
    println!("{}", format_result_line(&result));
    Ok(())
}
