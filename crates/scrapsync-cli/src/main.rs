//! scrapsync CLI - run and inspect the sync engine of a weighing station

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::check::run_check;
use crate::commands::common::resolve_db_path;
use crate::commands::discover::run_discover;
use crate::commands::run::run_background;
use crate::commands::status::run_status;
use crate::commands::sync::{run_download, run_sync, run_upload};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scrapsync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Run => run_background(&db_path).await?,
        Commands::Sync => run_sync(&db_path).await?,
        Commands::Upload => run_upload(&db_path).await?,
        Commands::Download { full } => run_download(full, &db_path).await?,
        Commands::Check { json } => run_check(json, &db_path).await?,
        Commands::Discover { timeout } => run_discover(timeout, &db_path).await?,
        Commands::Status { json } => run_status(json, &db_path)?,
    }

    Ok(())
}
