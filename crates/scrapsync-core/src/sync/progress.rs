//! Progress events published while a sync session runs

use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStage {
    Idle,
    Discovering,
    Connecting,
    Syncing,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub stage: SyncStage,
    /// 0 to 100
    pub percent: u8,
    pub message: String,
}

/// Fan-out of progress events. Slow subscribers miss old events rather than
/// block the session.
#[derive(Debug, Clone)]
pub(crate) struct ProgressBus {
    sender: broadcast::Sender<SyncProgress>,
}

impl ProgressBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncProgress> {
        self.sender.subscribe()
    }

    pub fn emit(&self, stage: SyncStage, percent: u8, message: impl Into<String>) {
        let progress = SyncProgress {
            stage,
            percent: percent.min(100),
            message: message.into(),
        };
        tracing::debug!(stage = ?progress.stage, percent = progress.percent, message = %progress.message, "Sync progress");
        // No subscribers is fine.
        let _ = self.sender.send(progress);
    }
}
