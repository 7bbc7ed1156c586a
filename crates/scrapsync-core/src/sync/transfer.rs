//! HTTP endpoint peers use to push and pull changed data.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use super::discovery::PeerRegistry;
use super::merge::MergeEngine;
use super::wait_for_shutdown;
use crate::db::{ChangeFilter, LocalStore};
use crate::models::{ChangedData, TenantId};

/// Rebind attempts after the listener closes before the endpoint gives up
const MAX_REBINDS: u32 = 5;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl From<crate::Error> for AppError {
    fn from(error: crate::Error) -> Self {
        Self::Internal(error.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
struct TransferState {
    store: Arc<dyn LocalStore>,
    tenant: TenantId,
    registry: PeerRegistry,
}

impl TransferState {
    fn check_tenant(&self, tenant: TenantId) -> Result<(), AppError> {
        if tenant == self.tenant {
            Ok(())
        } else {
            tracing::warn!(remote_tenant = %tenant, "Rejected transfer request for another tenant");
            Err(AppError::Forbidden("tenant mismatch".to_string()))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PushBody {
    pub tenant_id: TenantId,
    pub data: ChangedData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PushReply {
    pub success: bool,
    pub merged: usize,
    pub conflicts: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullQuery {
    since: Option<DateTime<Utc>>,
    tenant_id: Option<TenantId>,
}

/// Answer to `GET /sync/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    pub tenant_id: TenantId,
    /// Latest modification time across the tenant's records
    pub last_sync_time: Option<DateTime<Utc>>,
    pub device_count: usize,
}

fn transfer_router(state: TransferState) -> Router {
    Router::new()
        .route("/sync/push", post(push))
        .route("/sync/pull", get(pull))
        .route("/sync/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn push(
    State(state): State<TransferState>,
    body: Result<Json<PushBody>, JsonRejection>,
) -> Result<Json<PushReply>, AppError> {
    let Json(body) = body.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    state.check_tenant(body.tenant_id)?;

    let records = body.data.total_records();
    let store = state.store.clone();
    let tenant = state.tenant;
    let stats = tokio::task::spawn_blocking(move || {
        MergeEngine::new(store.as_ref(), tenant).merge(&body.data)
    })
    .await
    .map_err(|error| AppError::Internal(error.to_string()))?;

    tracing::info!(
        endpoint = "sync_push",
        records,
        merged = stats.merged,
        conflicts = stats.conflicts,
        deferred = stats.deferred,
        "Merged peer push"
    );
    Ok(Json(PushReply {
        success: true,
        merged: stats.merged,
        conflicts: stats.conflicts,
    }))
}

async fn pull(
    State(state): State<TransferState>,
    Query(query): Query<PullQuery>,
) -> Result<Json<ChangedData>, AppError> {
    if let Some(tenant) = query.tenant_id {
        state.check_tenant(tenant)?;
    }
    let filter = query
        .since
        .map_or(ChangeFilter::PendingUpload { since: None }, ChangeFilter::Since);
    let envelope = state.store.list_changed(state.tenant, filter)?;
    tracing::debug!(
        endpoint = "sync_pull",
        records = envelope.total_records(),
        "Served peer pull"
    );
    Ok(Json(envelope))
}

async fn status(State(state): State<TransferState>) -> Result<Json<TransferStatus>, AppError> {
    Ok(Json(TransferStatus {
        tenant_id: state.tenant,
        last_sync_time: state.store.latest_change(state.tenant)?,
        device_count: state.registry.len(),
    }))
}

/// Lifecycle of the transfer listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Binding,
    Serving { port: u16 },
    /// Waiting before rebind attempt `attempt`
    Backoff { attempt: u32, delay: Duration },
    /// Given up for the rest of the session
    Disabled,
}

/// Delay before rebind attempt `attempt` (1-based): 1 s doubling, capped at 60 s
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_secs(1_u64 << exponent).min(MAX_BACKOFF)
}

/// Peer transfer endpoint bound to a primary port with one fallback
pub struct TransferServer {
    state: TransferState,
    primary_port: u16,
    fallback_port: u16,
    listener_state: watch::Sender<ListenerState>,
}

impl TransferServer {
    pub fn new(
        store: Arc<dyn LocalStore>,
        tenant: TenantId,
        registry: PeerRegistry,
        primary_port: u16,
        fallback_port: u16,
    ) -> Self {
        let (listener_state, _) = watch::channel(ListenerState::Binding);
        Self {
            state: TransferState {
                store,
                tenant,
                registry,
            },
            primary_port,
            fallback_port,
            listener_state,
        }
    }

    pub fn listener_state(&self) -> ListenerState {
        *self.listener_state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.listener_state.subscribe()
    }

    /// Bind the primary port, falling back to the secondary once
    async fn bind(&self) -> Option<TcpListener> {
        for port in [self.primary_port, self.fallback_port] {
            let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            match TcpListener::bind(address).await {
                Ok(listener) => return Some(listener),
                Err(error) => tracing::warn!(port, %error, "Failed to bind transfer endpoint"),
            }
        }
        None
    }

    /// Bind and start serving.
    ///
    /// Returns the bound port, or `None` when both ports are taken; the
    /// endpoint is then disabled for the session.
    pub async fn start(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Option<(u16, JoinHandle<()>)> {
        self.listener_state.send_replace(ListenerState::Binding);
        let Some(listener) = self.bind().await else {
            tracing::warn!("Transfer endpoint disabled for this session");
            self.listener_state.send_replace(ListenerState::Disabled);
            return None;
        };
        let port = listener.local_addr().map(|address| address.port()).ok()?;
        let handle = tokio::spawn(self.run(listener, shutdown));
        Some((port, handle))
    }

    async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let router = transfer_router(self.state.clone());
        let mut listener = Some(listener);
        let mut attempt = 0;

        loop {
            if let Some(active) = listener.take() {
                let port = active.local_addr().map(|address| address.port()).unwrap_or_default();
                self.listener_state.send_replace(ListenerState::Serving { port });
                tracing::info!(port, "Transfer endpoint listening");
                attempt = 0;

                let mut stop = shutdown.clone();
                let served = axum::serve(active, router.clone())
                    .with_graceful_shutdown(async move { wait_for_shutdown(&mut stop).await })
                    .await;
                if *shutdown.borrow() {
                    break;
                }
                match served {
                    Ok(()) => tracing::warn!("Transfer listener closed unexpectedly"),
                    Err(error) => tracing::warn!(%error, "Transfer listener failed"),
                }
            }

            attempt += 1;
            if attempt > MAX_REBINDS {
                tracing::warn!("Transfer endpoint disabled after repeated rebind failures");
                self.listener_state.send_replace(ListenerState::Disabled);
                return;
            }

            let delay = backoff_delay(attempt);
            self.listener_state
                .send_replace(ListenerState::Backoff { attempt, delay });
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = wait_for_shutdown(&mut shutdown) => break,
            }

            self.listener_state.send_replace(ListenerState::Binding);
            listener = self.bind().await;
        }

        self.listener_state.send_replace(ListenerState::Disabled);
        tracing::info!("Transfer endpoint stopped");
    }
}
