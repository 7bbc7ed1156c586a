use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] scrapsync_core::Error),
    #[error(transparent)]
    Config(#[from] scrapsync_core::config::ConfigError),
    #[error(transparent)]
    Sync(#[from] scrapsync_core::sync::SyncError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    LogFilter(#[from] tracing_subscriber::filter::ParseError),
    #[error("Discovery timeout must be between 1 and 60 seconds")]
    InvalidTimeout,
    #[error("Sync failed: {0}")]
    SyncFailed(String),
}
