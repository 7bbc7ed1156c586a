use std::path::Path;

use crate::commands::common::{format_mismatch_lines, open_engine};
use crate::error::CliError;

pub async fn run_check(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let report = engine.check_mismatch().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_mismatch_lines(&report) {
            println!("{line}");
        }
    }
    Ok(())
}
