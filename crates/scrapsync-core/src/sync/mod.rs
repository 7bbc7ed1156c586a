//! Multi-device synchronization: merge, fingerprinting, cloud and peer transport,
//! and the orchestrator that schedules them.

mod cloud;
mod discovery;
mod fingerprint;
mod merge;
mod orchestrator;
mod peer_client;
mod progress;
mod transfer;

#[cfg(test)]
mod test_support;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::util::compact_text;

pub use cloud::{CloudSyncClient, PushOutcome, BATCH_SIZE, BATCH_THRESHOLD_BYTES};
pub use discovery::{PeerDiscovery, PeerRegistry, PresenceAnnouncement};
pub use fingerprint::{local_fingerprint, MismatchDetector, MismatchReport};
pub use merge::{MergeEngine, MergeStats};
pub use orchestrator::{SyncContext, SyncEngine, SyncStatus};
pub use peer_client::PeerClient;
pub use progress::{SyncProgress, SyncStage};
pub use transfer::{ListenerState, TransferServer, TransferStatus};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Remote returned an error: {message}")]
    Protocol { status: u16, message: String },
    #[error("Remote does not support sync endpoints")]
    SyncUnsupported,
    #[error("Payload too large for a single request")]
    PayloadTooLarge,
    #[error("Invalid sync payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Store(#[from] crate::Error),
    #[error("Invalid sync configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::InvalidPayload(compact_text(&error.to_string()))
        } else {
            Self::Network(compact_text(&error.to_string()))
        }
    }
}

/// Outcome of one sync session, reported to callers and on the progress stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    /// Another session was already running; nothing was done
    pub skipped: bool,
    /// Peer id or `"cloud"`
    pub source: Option<String>,
    /// Records merged from the remote side
    pub pulled: usize,
    /// Records accepted by the remote side
    pub pushed: usize,
    pub conflicts: usize,
    pub deferred: usize,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            ..Default::default()
        }
    }

    pub(crate) fn absorb_merge(&mut self, stats: MergeStats) {
        self.pulled += stats.merged;
        self.conflicts += stats.conflicts;
        self.deferred += stats.deferred;
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Turn a non-success response into a `Protocol` error with a short message
pub(crate) fn parse_api_error(status: StatusCode, body: &str) -> SyncError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|payload| payload.message.or(payload.error))
        .map_or_else(|| compact_text(body), |message| compact_text(&message));
    let message = if message.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{message} ({})", status.as_u16())
    };
    SyncError::Protocol {
        status: status.as_u16(),
        message,
    }
}

/// Resolve once `shutdown` reads `true` or its sender is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
