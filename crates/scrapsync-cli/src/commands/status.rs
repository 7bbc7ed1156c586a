use std::path::Path;

use crate::commands::common::{format_status_lines, open_engine};
use crate::error::CliError;

pub fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let status = engine.status()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Database:        {}", db_path.display());
        for line in format_status_lines(&status) {
            println!("{line}");
        }
    }
    Ok(())
}
