use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "scrapsync")]
#[command(about = "Synchronize weighing-station data over the LAN and with the cloud")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve peers, announce presence and run scheduled syncs until Ctrl-C
    Run,
    /// Sync once with the first peer that answers, or with the cloud
    Sync,
    /// Upload pending local changes to the cloud
    Upload,
    /// Download changes from the cloud
    Download {
        /// Ignore the sync cursor and pull everything
        #[arg(long)]
        full: bool,
    },
    /// Compare local and cloud data fingerprints
    Check {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List same-tenant devices on the local network
    Discover {
        /// Seconds to listen for announcements
        #[arg(short, long, value_name = "SECS")]
        timeout: Option<u64>,
    },
    /// Show cursors, pending uploads and configuration
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
