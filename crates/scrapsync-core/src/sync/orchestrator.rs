//! Schedules sync sessions against LAN peers and the cloud.
//!
//! At most one session runs at a time. Triggers arriving while a session is in
//! flight (manual calls or background timers) are dropped and reported as
//! skipped. Background timers observe the shutdown signal only while waiting
//! for their next tick, so stopping never interrupts a running session.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::cloud::CloudSyncClient;
use super::discovery::PeerDiscovery;
use super::fingerprint::{MismatchDetector, MismatchReport};
use super::merge::{MergeEngine, MergeStats};
use super::peer_client::PeerClient;
use super::progress::{ProgressBus, SyncProgress, SyncStage};
use super::transfer::TransferServer;
use super::{wait_for_shutdown, SyncError, SyncResult};
use crate::config::SyncSettings;
use crate::db::{ChangeFilter, LocalStore, SyncCursors, UploadReceipt};
use crate::models::{ChangedData, DeviceDescriptor, TenantId};
use crate::util::{from_millis, now_millis};

const CLOUD_SOURCE: &str = "cloud";

/// Who is syncing: built once per session and handed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncContext {
    pub tenant: TenantId,
    pub device_name: String,
}

impl SyncContext {
    pub fn new(tenant: TenantId, device_name: impl Into<String>) -> Self {
        Self {
            tenant,
            device_name: device_name.into(),
        }
    }
}

impl From<&SyncSettings> for SyncContext {
    fn from(settings: &SyncSettings) -> Self {
        Self::new(settings.tenant, settings.device_name.clone())
    }
}

/// Snapshot of the engine for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub tenant_id: TenantId,
    pub device_name: String,
    /// A session is in flight
    pub running: bool,
    pub background: bool,
    /// Configured and not disabled by an unsupported-sync answer
    pub cloud_enabled: bool,
    pub transfer_port: Option<u16>,
    pub peers: Vec<DeviceDescriptor>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_upload_time: Option<DateTime<Utc>>,
    pub pending_upload: usize,
}

struct Background {
    shutdown: watch::Sender<bool>,
    transfer_port: Option<u16>,
    discovery_active: bool,
    tasks: Vec<JoinHandle<()>>,
}

struct EngineInner {
    context: SyncContext,
    settings: SyncSettings,
    store: Arc<dyn LocalStore>,
    cloud: Option<CloudSyncClient>,
    cloud_disabled: AtomicBool,
    running: AtomicBool,
    progress: ProgressBus,
    discovery: PeerDiscovery,
    detector: MismatchDetector,
    last_silent_pull: Mutex<Option<Instant>>,
    online: Mutex<Option<bool>>,
    background: Mutex<Option<Background>>,
}

/// Releases the single-flight flag when the session ends
struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Entry point for every sync operation. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn LocalStore>, settings: SyncSettings) -> Result<Self, SyncError> {
        let context = SyncContext::from(&settings);
        let cloud = settings
            .cloud_url
            .as_deref()
            .map(|url| CloudSyncClient::new(url, context.tenant))
            .transpose()?;
        let discovery = PeerDiscovery::new(
            context.tenant,
            context.device_name.clone(),
            settings.discovery_port,
            settings.intervals.announce,
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                detector: MismatchDetector::new(settings.mismatch_suppression),
                context,
                settings,
                store,
                cloud,
                cloud_disabled: AtomicBool::new(false),
                running: AtomicBool::new(false),
                progress: ProgressBus::new(),
                discovery,
                last_silent_pull: Mutex::new(None),
                online: Mutex::new(None),
                background: Mutex::new(None),
            }),
        })
    }

    pub fn context(&self) -> &SyncContext {
        &self.inner.context
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<SyncProgress> {
        self.inner.progress.subscribe()
    }

    fn tenant(&self) -> TenantId {
        self.inner.context.tenant
    }

    fn store(&self) -> &dyn LocalStore {
        self.inner.store.as_ref()
    }

    fn cursors(&self) -> SyncCursors<'_, dyn LocalStore> {
        SyncCursors::new(self.inner.store.as_ref(), self.tenant())
    }

    fn cloud(&self) -> Option<&CloudSyncClient> {
        if self.inner.cloud_disabled.load(Ordering::Acquire) {
            return None;
        }
        self.inner.cloud.as_ref()
    }

    fn require_cloud(&self) -> Result<&CloudSyncClient, SyncError> {
        self.cloud().ok_or_else(|| {
            if self.inner.cloud.is_some() {
                SyncError::SyncUnsupported
            } else {
                SyncError::InvalidConfiguration("cloud URL is not configured".to_string())
            }
        })
    }

    fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard {
                running: &self.inner.running,
            })
    }

    fn emit(&self, quiet: bool, stage: SyncStage, percent: u8, message: impl Into<String>) {
        if !quiet {
            self.inner.progress.emit(stage, percent, message);
        }
    }

    fn note_cloud_error(&self, error: &SyncError) {
        if matches!(error, SyncError::SyncUnsupported)
            && !self.inner.cloud_disabled.swap(true, Ordering::AcqRel)
        {
            tracing::warn!("Cloud has no sync endpoints; cloud sync disabled for this session");
        }
    }

    fn finish(&self, quiet: bool, outcome: Result<SyncResult, SyncError>) -> SyncResult {
        match outcome {
            Ok(result) if result.success => {
                tracing::info!(
                    source = result.source.as_deref().unwrap_or("none"),
                    pulled = result.pulled,
                    pushed = result.pushed,
                    conflicts = result.conflicts,
                    deferred = result.deferred,
                    "Sync completed"
                );
                self.emit(
                    quiet,
                    SyncStage::Completed,
                    100,
                    format!(
                        "Sync completed: {} received, {} sent",
                        result.pulled, result.pushed
                    ),
                );
                result
            }
            Ok(result) => {
                let message = result.errors.join("; ");
                tracing::warn!(error = %message, "Sync failed");
                self.emit(quiet, SyncStage::Error, 100, message);
                result
            }
            Err(error) => {
                self.note_cloud_error(&error);
                tracing::warn!(%error, "Sync failed");
                self.emit(quiet, SyncStage::Error, 100, error.to_string());
                SyncResult::failure(error.to_string())
            }
        }
    }

    /// Sync with the first peer that answers, falling back to the cloud
    pub async fn perform_auto_sync(&self) -> SyncResult {
        let Some(_guard) = self.try_begin() else {
            tracing::debug!("Sync already in progress; dropping trigger");
            return SyncResult::skipped();
        };
        let outcome = self.auto_sync_session().await;
        self.finish(false, outcome)
    }

    async fn auto_sync_session(&self) -> Result<SyncResult, SyncError> {
        if self.inner.settings.peer_sync_enabled {
            self.emit(false, SyncStage::Discovering, 5, "Looking for devices on the network");
            let devices = self.discover_devices(self.inner.settings.discovery_window).await;
            tracing::debug!(devices = devices.len(), "Discovery window closed");

            for device in devices {
                self.emit(
                    false,
                    SyncStage::Connecting,
                    25,
                    format!("Connecting to {}", device.name),
                );
                match self.sync_with_peer(&device).await {
                    Ok(result) => return Ok(result),
                    Err(error) => {
                        tracing::warn!(peer = %device.id, %error, "Peer sync failed; trying next");
                    }
                }
            }
        }

        let cloud = self.require_cloud().map_err(|error| match error {
            SyncError::InvalidConfiguration(_) => SyncError::InvalidConfiguration(
                "no peer answered and cloud sync is not configured".to_string(),
            ),
            other => other,
        })?;
        self.emit(false, SyncStage::Connecting, 30, "Connecting to cloud");
        self.sync_with_cloud(cloud, false).await
    }

    /// Pull from the peer, merge, then push the local pending set.
    ///
    /// Pushing to a peer never clears `needs_upload`; only the cloud does.
    async fn sync_with_peer(&self, device: &DeviceDescriptor) -> Result<SyncResult, SyncError> {
        let client = PeerClient::for_device(device, self.tenant())?;
        let status = client.status().await?;
        if status.tenant_id != self.tenant() {
            return Err(SyncError::Protocol {
                status: 403,
                message: format!("peer {} belongs to another tenant", device.id),
            });
        }

        let mut result = SyncResult::success();
        result.source = Some(device.id.clone());

        self.emit(false, SyncStage::Syncing, 40, format!("Receiving from {}", device.name));
        let cursor = if self.store().aggregates(self.tenant())?.is_empty() {
            None
        } else {
            self.cursors().last_sync_time()?
        };
        let since = cursor.unwrap_or_else(|| from_millis(0));
        let incoming = client.pull(Some(since)).await?;
        result.absorb_merge(self.merge(incoming).await?);

        self.emit(false, SyncStage::Syncing, 70, format!("Sending to {}", device.name));
        let outgoing = self
            .store()
            .list_changed(self.tenant(), ChangeFilter::PendingUpload { since: None })?;
        match client.push(&outgoing).await {
            Ok(_) => result.pushed = outgoing.total_records(),
            Err(error) => {
                tracing::warn!(peer = %device.id, %error, "Push to peer failed");
                result.errors.push(error.to_string());
            }
        }
        Ok(result)
    }

    /// Download then upload; either step may fail without aborting the other
    async fn sync_with_cloud(
        &self,
        cloud: &CloudSyncClient,
        quiet: bool,
    ) -> Result<SyncResult, SyncError> {
        let mut result = SyncResult::success();
        result.source = Some(CLOUD_SOURCE.to_string());
        let mut failed_steps = 0;

        self.emit(quiet, SyncStage::Syncing, 40, "Downloading changes from cloud");
        match self.download(cloud, false).await {
            Ok(stats) => result.absorb_merge(stats),
            Err(SyncError::SyncUnsupported) => return Err(SyncError::SyncUnsupported),
            Err(error) => {
                failed_steps += 1;
                result.errors.push(error.to_string());
            }
        }

        self.emit(quiet, SyncStage::Syncing, 70, "Uploading local changes");
        match self.upload(cloud).await {
            Ok(pushed) => result.pushed = pushed,
            Err(SyncError::SyncUnsupported) => return Err(SyncError::SyncUnsupported),
            Err(error) => {
                failed_steps += 1;
                result.errors.push(error.to_string());
            }
        }

        result.success = failed_steps < 2;
        Ok(result)
    }

    /// Push every pending record to the cloud
    pub async fn upload_only(&self) -> SyncResult {
        self.upload_session(false).await
    }

    async fn upload_session(&self, quiet: bool) -> SyncResult {
        let Some(_guard) = self.try_begin() else {
            return SyncResult::skipped();
        };
        let outcome = async {
            let cloud = self.require_cloud()?;
            self.emit(quiet, SyncStage::Syncing, 30, "Uploading local changes");
            let pushed = self.upload(cloud).await?;
            Ok::<_, SyncError>(SyncResult {
                source: Some(CLOUD_SOURCE.to_string()),
                pushed,
                ..SyncResult::success()
            })
        }
        .await;
        self.finish(quiet, outcome)
    }

    /// Pull from the cloud and merge. `force_full` ignores the cursor.
    pub async fn download_only(&self, force_full: bool) -> SyncResult {
        self.download_session(force_full, false).await
    }

    async fn download_session(&self, force_full: bool, quiet: bool) -> SyncResult {
        let Some(_guard) = self.try_begin() else {
            return SyncResult::skipped();
        };
        let outcome = async {
            let cloud = self.require_cloud()?;
            self.emit(quiet, SyncStage::Syncing, 30, "Downloading changes from cloud");
            let stats = self.download(cloud, force_full).await?;
            let mut result = SyncResult::success();
            result.source = Some(CLOUD_SOURCE.to_string());
            result.absorb_merge(stats);
            Ok::<_, SyncError>(result)
        }
        .await;
        self.finish(quiet, outcome)
    }

    async fn download(
        &self,
        cloud: &CloudSyncClient,
        force_full: bool,
    ) -> Result<MergeStats, SyncError> {
        let first_run = self.store().aggregates(self.tenant())?.is_empty();
        let since = if force_full || first_run {
            None
        } else {
            self.cursors().last_sync_time()?
        };

        let started = now_millis();
        let envelope = match cloud.pull(since).await {
            Ok(envelope) => envelope,
            Err(error) => {
                self.note_cloud_error(&error);
                return Err(error);
            }
        };
        let cursor = envelope.captured_at.unwrap_or(started);
        let stats = self.merge(envelope).await?;
        self.cursors().set_last_sync_time(cursor)?;

        tracing::info!(
            full = since.is_none(),
            merged = stats.merged,
            conflicts = stats.conflicts,
            deferred = stats.deferred,
            "Cloud download applied"
        );
        Ok(stats)
    }

    /// Push the pending set and acknowledge what the cloud accepted.
    ///
    /// A failed push leaves every flag set; batches the cloud already took are
    /// sent again next time.
    async fn upload(&self, cloud: &CloudSyncClient) -> Result<usize, SyncError> {
        let cursors = self.cursors();
        let last_upload = cursors.last_upload_time()?;
        let pending = self
            .store()
            .list_changed(self.tenant(), ChangeFilter::PendingUpload { since: last_upload })?;
        if pending.is_empty() {
            tracing::debug!("Nothing pending upload");
            return Ok(0);
        }

        let started = now_millis();
        let outcome = match cloud.push(&pending).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.note_cloud_error(&error);
                return Err(error);
            }
        };

        let mut stale = 0;
        for record in pending.records() {
            let meta = record.meta();
            let kind = record.kind();
            let receipt = UploadReceipt {
                kind,
                id: meta.id,
                pushed_version: meta.effective_updated_at(),
                cloud_id: outcome.cloud_id(kind, meta.id),
            };
            if !self.store().mark_uploaded(self.tenant(), &receipt)? {
                stale += 1;
            }
        }
        self.cursors().set_last_upload_time(started)?;

        tracing::info!(
            records = pending.total_records(),
            requests = outcome.requests,
            edited_since_push = stale,
            "Cloud upload acknowledged"
        );
        Ok(outcome.accepted)
    }

    async fn merge(&self, envelope: ChangedData) -> Result<MergeStats, SyncError> {
        let store = Arc::clone(&self.inner.store);
        let tenant = self.tenant();
        tokio::task::spawn_blocking(move || MergeEngine::new(store.as_ref(), tenant).merge(&envelope))
            .await
            .map_err(|error| SyncError::Store(crate::Error::Database(error.to_string())))
    }

    /// Compare the local fingerprint with the cloud's
    pub async fn check_mismatch(&self) -> Result<MismatchReport, SyncError> {
        let cloud = self.require_cloud()?;
        let cloud_hash = cloud.fetch_hash().await;
        let aggregates = self.store().aggregates(self.tenant())?;
        let last_upload = self.cursors().last_upload_time()?;
        let report = self
            .inner
            .detector
            .evaluate(&aggregates, cloud_hash, last_upload, Utc::now());
        if report.suppressed {
            tracing::debug!("Fingerprint mismatch inside the post-upload window; ignoring");
        }
        Ok(report)
    }

    /// On mismatch, pull everything from the cloud without progress events.
    /// Runs at most once per debounce period.
    async fn reconcile(&self) {
        let report = match self.check_mismatch().await {
            Ok(report) => report,
            Err(error) => {
                tracing::debug!(%error, "Mismatch check failed");
                return;
            }
        };
        if !report.mismatched {
            return;
        }

        let previous = {
            let mut last = self
                .inner
                .last_silent_pull
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let debounce = self.inner.settings.intervals.realtime_debounce;
            if last.is_some_and(|at| at.elapsed() < debounce) {
                tracing::debug!("Silent pull debounced");
                return;
            }
            last.replace(Instant::now())
        };

        tracing::info!(
            local_hash = %report.local_hash,
            cloud_hash = report.cloud_hash.as_deref().unwrap_or("unknown"),
            "Data differs from cloud; pulling full copy"
        );
        let result = self.download_session(true, true).await;
        if result.skipped {
            // Another session held the guard; the debounce slot stays free.
            *self
                .inner
                .last_silent_pull
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = previous;
        } else if !result.success {
            tracing::warn!(errors = ?result.errors, "Silent pull failed");
        }
    }

    /// Probe the cloud; after coming back online flush uploads and reconcile
    async fn network_check(&self) {
        let Some(cloud) = self.cloud() else {
            return;
        };
        let reachable = cloud.is_reachable().await;
        let previous = self
            .inner
            .online
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(reachable);

        match (previous, reachable) {
            (Some(false), true) => {
                tracing::info!("Cloud reachable again; flushing uploads");
                let result = self.upload_session(true).await;
                if !result.success && !result.skipped {
                    tracing::warn!(errors = ?result.errors, "Upload after reconnect failed");
                }
                self.reconcile().await;
            }
            (Some(true) | None, false) => tracing::warn!("Cloud unreachable"),
            _ => {}
        }
    }

    /// Same-tenant devices heard from within `window`.
    ///
    /// Uses the background listener when it runs; otherwise listens on its
    /// own for the window without announcing.
    pub async fn discover_devices(&self, window: Duration) -> Vec<DeviceDescriptor> {
        let discovery_active = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|background| background.discovery_active);
        if discovery_active {
            return self.inner.discovery.discover_devices(window).await;
        }

        let socket = match self.inner.discovery.bind() {
            Ok(socket) => socket,
            Err(error) => {
                tracing::warn!(%error, "Discovery unavailable");
                return Vec::new();
            }
        };
        let (stop, shutdown) = watch::channel(false);
        let listener =
            self.inner
                .discovery
                .spawn(socket, Arc::clone(&self.inner.store), None, shutdown);
        let devices = self.inner.discovery.discover_devices(window).await;
        stop.send_replace(true);
        let _ = listener.await;
        devices
    }

    pub fn status(&self) -> Result<SyncStatus, SyncError> {
        let cursors = self.cursors();
        let last_upload_time = cursors.last_upload_time()?;
        let pending_upload = self
            .store()
            .list_changed(
                self.tenant(),
                ChangeFilter::PendingUpload {
                    since: last_upload_time,
                },
            )?
            .total_records();
        let (background, transfer_port) = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or((false, None), |background| (true, background.transfer_port));

        Ok(SyncStatus {
            tenant_id: self.tenant(),
            device_name: self.inner.context.device_name.clone(),
            running: self.inner.running.load(Ordering::Acquire),
            background,
            cloud_enabled: self.cloud().is_some(),
            transfer_port,
            peers: self.inner.discovery.registry().snapshot(),
            last_sync_time: cursors.last_sync_time()?,
            last_upload_time,
            pending_upload,
        })
    }

    /// Start the transfer endpoint, discovery and the periodic timers.
    ///
    /// Bind failures are not fatal: without a transfer port discovery only
    /// listens, and without a discovery socket only the cloud is used.
    /// Returns `false` when background sync was already running.
    pub async fn start_background_sync(&self) -> bool {
        if self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            tracing::debug!("Background sync already running");
            return false;
        }

        let (shutdown, receiver) = watch::channel(false);
        let settings = &self.inner.settings;
        let mut tasks = Vec::new();
        let mut transfer_port = None;
        let mut discovery_active = false;

        if settings.peer_sync_enabled {
            let server = TransferServer::new(
                Arc::clone(&self.inner.store),
                self.tenant(),
                self.inner.discovery.registry(),
                settings.transfer_port,
                settings.transfer_fallback_port,
            );
            if let Some((port, handle)) = server.start(receiver.clone()).await {
                transfer_port = Some(port);
                tasks.push(handle);
            }

            match self.inner.discovery.bind() {
                Ok(socket) => {
                    tasks.push(self.inner.discovery.spawn(
                        socket,
                        Arc::clone(&self.inner.store),
                        transfer_port,
                        receiver.clone(),
                    ));
                    discovery_active = true;
                }
                Err(error) => tracing::warn!(%error, "Peer discovery unavailable"),
            }
        }

        let intervals = settings.intervals;
        tasks.push(self.spawn_periodic(intervals.upload, receiver.clone(), |engine| async move {
            let result = engine.upload_session(true).await;
            if !result.success && !result.skipped {
                tracing::warn!(errors = ?result.errors, "Scheduled upload failed");
            }
        }));
        tasks.push(self.spawn_periodic(intervals.realtime, receiver.clone(), |engine| async move {
            if engine.cloud().is_some() {
                engine.reconcile().await;
            }
        }));
        tasks.push(self.spawn_periodic(intervals.network, receiver, |engine| async move {
            engine.network_check().await;
        }));

        tracing::info!(
            transfer_port = ?transfer_port,
            discovery = discovery_active,
            cloud = self.cloud().is_some(),
            "Background sync started"
        );
        *self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Background {
            shutdown,
            transfer_port,
            discovery_active,
            tasks,
        });
        true
    }

    /// Cancel future timer firings and stop listening. A session already in
    /// flight runs to completion.
    pub fn stop_background_sync(&self) {
        let background = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(background) = background else {
            return;
        };
        background.shutdown.send_replace(true);
        self.inner.discovery.registry().clear();
        tracing::info!(tasks = background.tasks.len(), "Background sync stopped");
    }

    fn spawn_periodic<F, Fut>(
        &self,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        job: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Self) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = wait_for_shutdown(&mut shutdown) => break,
                }
                job(engine.clone()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::models::{Customer, EntityKind, Record, Weighing, WeighingSession};
    use crate::sync::local_fingerprint;
    use crate::sync::test_support::MockCloud;
    use crate::sync::PeerRegistry;
    use pretty_assertions::assert_eq;

    const TENANT: TenantId = TenantId(7);

    fn settings(cloud_url: Option<String>) -> SyncSettings {
        SyncSettings {
            cloud_url,
            transfer_port: 0,
            transfer_fallback_port: 0,
            discovery_port: 0,
            peer_sync_enabled: false,
            discovery_window: Duration::from_millis(100),
            ..SyncSettings::new(TENANT)
        }
    }

    fn engine(store: &Arc<SqliteStore>, cloud_url: Option<String>) -> SyncEngine {
        SyncEngine::new(store.clone(), settings(cloud_url)).unwrap()
    }

    fn memory_store() -> Arc<SqliteStore> {
        Arc::new(SqliteStore::open_in_memory().unwrap())
    }

    fn pending(store: &SqliteStore) -> usize {
        store
            .list_changed(TENANT, ChangeFilter::PendingUpload { since: None })
            .unwrap()
            .total_records()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_download_into_empty_store_is_a_full_pull() {
        let cloud = MockCloud::default();
        cloud.set_pull_response(ChangedData {
            customers: (1..=5).map(|id| Customer::new(id, format!("Customer {id}"))).collect(),
            ..ChangedData::default()
        });
        let store = memory_store();
        let engine = engine(&store, Some(cloud.spawn().await));
        engine.cursors().set_last_sync_time(now_millis()).unwrap();

        let result = engine.download_only(false).await;

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.pulled, 5);
        assert_eq!(result.conflicts, 0);
        assert_eq!(cloud.pulls()[0].since, None);
        assert_eq!(store.aggregates(TENANT).unwrap().count(EntityKind::Customer), 5);
        // Records that came from the cloud are not uploaded back.
        assert_eq!(pending(&store), 0);
        assert!(engine.cursors().last_sync_time().unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn older_cloud_copy_is_a_conflict() {
        let store = memory_store();
        let local = Customer::new(1, "Local");
        store.upsert(TENANT, &Record::Customer(local.clone())).unwrap();

        let mut remote = Customer::new(1, "Remote");
        remote.meta.updated_at = Some(local.meta.effective_updated_at() - chrono::Duration::minutes(5));
        let cloud = MockCloud::default();
        cloud.set_pull_response(ChangedData {
            customers: vec![remote],
            ..ChangedData::default()
        });
        let engine = engine(&store, Some(cloud.spawn().await));

        let result = engine.download_only(false).await;
        assert_eq!(result.pulled, 0);
        assert_eq!(result.conflicts, 1);
        let Some(Record::Customer(stored)) = store.find(TENANT, EntityKind::Customer, 1).unwrap()
        else {
            panic!("customer missing");
        };
        assert_eq!(stored.name, "Local");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn large_upload_is_batched_and_acknowledged() {
        let cloud = MockCloud::default();
        cloud.assign_cloud_ids();
        let store = memory_store();
        let photo = "p".repeat(2_500);
        for id in 1..=250 {
            let weighing = Weighing {
                photo_path: Some(photo.clone()),
                ..Weighing::new(id, 1, 120.0, 20.0, 1.5)
            };
            store.upsert(TENANT, &Record::Weighing(weighing)).unwrap();
        }
        let engine = engine(&store, Some(cloud.spawn().await));

        let result = engine.upload_only().await;

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.pushed, 250);
        assert_eq!(cloud.pushes().len(), 3);
        assert_eq!(pending(&store), 0);
        let Some(Record::Weighing(stored)) = store.find(TENANT, EntityKind::Weighing, 42).unwrap()
        else {
            panic!("weighing missing");
        };
        assert_eq!(stored.meta.cloud_id, Some(1_042));
        assert!(engine.cursors().last_upload_time().unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_batch_keeps_records_pending() {
        let cloud = MockCloud::default();
        cloud.fail_pushes_after(1);
        let store = memory_store();
        let photo = "p".repeat(2_500);
        for id in 1..=250 {
            let weighing = Weighing {
                photo_path: Some(photo.clone()),
                ..Weighing::new(id, 1, 120.0, 20.0, 1.5)
            };
            store.upsert(TENANT, &Record::Weighing(weighing)).unwrap();
        }
        let engine = engine(&store, Some(cloud.spawn().await));

        let result = engine.upload_only().await;

        assert!(!result.success);
        assert_eq!(pending(&store), 250);
        assert!(engine.cursors().last_upload_time().unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn matching_fingerprints_report_no_mismatch() {
        let store = memory_store();
        for id in 1..=3 {
            store
                .upsert(TENANT, &Record::Customer(Customer::new(id, format!("C{id}"))))
                .unwrap();
        }
        for id in 1..=2 {
            store
                .upsert(TENANT, &Record::WeighingSession(WeighingSession::new(id, 1)))
                .unwrap();
        }
        for id in 1..=4 {
            store
                .upsert(TENANT, &Record::Weighing(Weighing::new(id, 1, 50.5, 5.0, 2.0)))
                .unwrap();
        }
        let cloud = MockCloud::default();
        cloud.set_hash(&local_fingerprint(&store.aggregates(TENANT).unwrap()));
        let engine = engine(&store, Some(cloud.spawn().await));

        let report = engine.check_mismatch().await.unwrap();
        assert!(!report.mismatched);
        assert!(!report.suppressed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mismatch_is_suppressed_right_after_upload() {
        let store = memory_store();
        store
            .upsert(TENANT, &Record::Customer(Customer::new(1, "Ada")))
            .unwrap();
        let cloud = MockCloud::default();
        cloud.set_hash("0000");
        let engine = engine(&store, Some(cloud.spawn().await));

        assert!(engine.check_mismatch().await.unwrap().mismatched);

        assert!(engine.upload_only().await.success);
        let report = engine.check_mismatch().await.unwrap();
        assert!(!report.mismatched);
        assert!(report.suppressed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mismatch_triggers_one_silent_full_pull_per_debounce_period() {
        let store = memory_store();
        store
            .upsert(TENANT, &Record::Customer(Customer::new(1, "Ada")))
            .unwrap();
        let cloud = MockCloud::default();
        cloud.set_hash("0000");
        cloud.set_pull_response(ChangedData {
            customers: vec![Customer::new(2, "Grace")],
            ..ChangedData::default()
        });
        let engine = engine(&store, Some(cloud.spawn().await));
        engine.cursors().set_last_sync_time(now_millis()).unwrap();
        let mut progress = engine.subscribe_progress();

        engine.reconcile().await;
        assert_eq!(cloud.pulls().len(), 1);
        assert_eq!(cloud.pulls()[0].since, None);
        assert!(store.exists(TENANT, EntityKind::Customer, 2).unwrap());
        assert!(progress.try_recv().is_err());

        engine.reconcile().await;
        assert_eq!(cloud.pulls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn skipped_silent_pull_leaves_debounce_slot_free() {
        let store = memory_store();
        store
            .upsert(TENANT, &Record::Customer(Customer::new(1, "Ada")))
            .unwrap();
        let cloud = MockCloud::default();
        cloud.set_hash("0000");
        let engine = engine(&store, Some(cloud.spawn().await));

        let guard = engine.try_begin().unwrap();
        engine.reconcile().await;
        assert!(cloud.pulls().is_empty());
        drop(guard);

        engine.reconcile().await;
        assert_eq!(cloud.pulls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn coming_back_online_flushes_pending_uploads() {
        let store = memory_store();
        for id in 1..=3 {
            store
                .upsert(TENANT, &Record::Customer(Customer::new(id, format!("C{id}"))))
                .unwrap();
        }
        let cloud = MockCloud::default();
        cloud.set_hash(&local_fingerprint(&store.aggregates(TENANT).unwrap()));
        let engine = engine(&store, Some(cloud.spawn().await));
        *engine.inner.online.lock().unwrap() = Some(false);

        engine.network_check().await;

        assert_eq!(cloud.pushed_records(), 3);
        assert_eq!(pending(&store), 0);
        assert_eq!(*engine.inner.online.lock().unwrap(), Some(true));

        // Already online: nothing to flush.
        store
            .upsert(TENANT, &Record::Customer(Customer::new(4, "C4")))
            .unwrap();
        engine.network_check().await;
        assert_eq!(cloud.pushed_records(), 3);
        assert_eq!(pending(&store), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsupported_cloud_disables_cloud_sync() {
        let cloud = MockCloud::default();
        cloud.disable_sync();
        let store = memory_store();
        let engine = engine(&store, Some(cloud.spawn().await));

        let first = engine.download_only(false).await;
        assert!(!first.success);
        assert!(!engine.status().unwrap().cloud_enabled);

        let second = engine.upload_only().await;
        assert!(!second.success);
        assert!(second.errors[0].contains("does not support"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_trigger_is_skipped() {
        let store = memory_store();
        let engine = engine(&store, None);

        let guard = engine.try_begin().unwrap();
        assert!(engine.upload_only().await.skipped);
        assert!(engine.perform_auto_sync().await.skipped);
        assert!(engine.status().unwrap().running);
        drop(guard);

        let result = engine.upload_only().await;
        assert!(!result.skipped);
        assert!(!engine.status().unwrap().running);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn progress_stream_reports_completion() {
        let cloud = MockCloud::default();
        let store = memory_store();
        let engine = engine(&store, Some(cloud.spawn().await));
        let mut progress = engine.subscribe_progress();

        assert!(engine.perform_auto_sync().await.success);

        let mut stages = Vec::new();
        while let Ok(event) = progress.try_recv() {
            stages.push(event.stage);
        }
        assert_eq!(stages.first(), Some(&SyncStage::Connecting));
        assert_eq!(stages.last(), Some(&SyncStage::Completed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auto_sync_without_peers_or_cloud_fails() {
        let store = memory_store();
        let engine = engine(&store, None);
        let mut progress = engine.subscribe_progress();

        let result = engine.perform_auto_sync().await;
        assert!(!result.success);
        assert!(result.errors[0].contains("not configured"));
        let mut last = None;
        while let Ok(event) = progress.try_recv() {
            last = Some(event.stage);
        }
        assert_eq!(last, Some(SyncStage::Error));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn peer_sync_exchanges_without_clearing_upload_flags() {
        let peer_store = memory_store();
        peer_store
            .upsert(TENANT, &Record::Customer(Customer::new(1, "From peer")))
            .unwrap();
        let (_stop, shutdown) = watch::channel(false);
        let server = TransferServer::new(
            peer_store.clone(),
            TENANT,
            PeerRegistry::default(),
            0,
            0,
        );
        let (port, _handle) = server.start(shutdown).await.unwrap();

        let local_store = memory_store();
        local_store
            .upsert(TENANT, &Record::Customer(Customer::new(2, "From here")))
            .unwrap();
        let engine = engine(&local_store, None);
        let device = DeviceDescriptor::new(
            format!("127.0.0.1:{port}").parse().unwrap(),
            "peer",
            TENANT,
            None,
        );

        let result = engine.sync_with_peer(&device).await.unwrap();

        assert_eq!(result.source.as_deref(), Some(device.id.as_str()));
        assert_eq!(result.pulled, 1);
        assert_eq!(result.pushed, 1);
        assert_eq!(local_store.aggregates(TENANT).unwrap().total_records(), 2);
        assert_eq!(peer_store.aggregates(TENANT).unwrap().total_records(), 2);
        // Only the cloud acknowledges; the local edit is still pending.
        assert_eq!(pending(&local_store), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_sync_starts_and_stops() {
        let store = memory_store();
        let engine = SyncEngine::new(
            store.clone(),
            SyncSettings {
                peer_sync_enabled: true,
                ..settings(None)
            },
        )
        .unwrap();

        assert!(engine.start_background_sync().await);
        assert!(!engine.start_background_sync().await);
        let status = engine.status().unwrap();
        assert!(status.background);
        assert!(status.transfer_port.is_some());

        engine.stop_background_sync();
        let status = engine.status().unwrap();
        assert!(!status.background);
        assert_eq!(status.transfer_port, None);
    }

    #[test]
    fn context_comes_from_settings() {
        let settings = SyncSettings {
            device_name: "scale-3".to_string(),
            ..SyncSettings::new(TENANT)
        };
        assert_eq!(SyncContext::from(&settings), SyncContext::new(TENANT, "scale-3"));
    }
}
