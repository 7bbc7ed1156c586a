//! In-process cloud server for tests, bound to an ephemeral local port.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::models::{ChangedData, EntityKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPull {
    pub activation_id: Option<String>,
    pub since: Option<String>,
}

#[derive(Default)]
struct MockState {
    pulls: Vec<RecordedPull>,
    pushes: Vec<Value>,
    pull_response: ChangedData,
    hash: Option<String>,
    sync_disabled: bool,
    assign_cloud_ids: bool,
    reject_over: Option<usize>,
    fail_after: Option<usize>,
    accepted: usize,
}

/// Records every request and answers with configurable responses
#[derive(Clone, Default)]
pub struct MockCloud {
    state: Arc<Mutex<MockState>>,
}

impl MockCloud {
    pub fn set_pull_response(&self, envelope: ChangedData) {
        self.state.lock().unwrap().pull_response = envelope;
    }

    pub fn set_hash(&self, hash: &str) {
        self.state.lock().unwrap().hash = Some(hash.to_string());
    }

    /// Answer every `/sync/*` request with 404
    pub fn disable_sync(&self) {
        self.state.lock().unwrap().sync_disabled = true;
    }

    /// Return an `idMap` assigning `cloudId = id + 1000`
    pub fn assign_cloud_ids(&self) {
        self.state.lock().unwrap().assign_cloud_ids = true;
    }

    /// Answer 413 to pushes carrying more than `records` records
    pub fn reject_requests_over(&self, records: usize) {
        self.state.lock().unwrap().reject_over = Some(records);
    }

    /// Answer 500 to every push after the first `received`
    pub fn fail_pushes_after(&self, received: usize) {
        self.state.lock().unwrap().fail_after = Some(received);
    }

    pub fn pulls(&self) -> Vec<RecordedPull> {
        self.state.lock().unwrap().pulls.clone()
    }

    pub fn pushes(&self) -> Vec<Value> {
        self.state.lock().unwrap().pushes.clone()
    }

    /// Total records across accepted pushes
    pub fn pushed_records(&self) -> usize {
        self.state.lock().unwrap().accepted
    }

    /// Serve on `127.0.0.1:0` and return the base URL
    pub async fn spawn(&self) -> String {
        let router = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/sync/pull", get(pull))
            .route("/sync/push", post(push))
            .route("/sync/hash", get(hash))
            .with_state(self.state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock cloud");
        let address = listener.local_addr().expect("local address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{address}")
    }
}

type Shared = Arc<Mutex<MockState>>;

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
}

async fn pull(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut state = state.lock().unwrap();
    if state.sync_disabled {
        return not_found();
    }
    state.pulls.push(RecordedPull {
        activation_id: params.get("activationId").cloned(),
        since: params.get("since").cloned(),
    });
    Json(state.pull_response.clone()).into_response()
}

async fn push(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    if state.sync_disabled {
        return not_found();
    }
    state.pushes.push(body.clone());

    let data: ChangedData = serde_json::from_value(body["data"].clone()).unwrap_or_default();
    let records = data.total_records();
    if state.reject_over.is_some_and(|limit| records > limit) {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({"error": "payload too large"})),
        )
            .into_response();
    }
    let earlier = state.pushes.len() - 1;
    if state.fail_after.is_some_and(|limit| earlier >= limit) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "storage unavailable"})),
        )
            .into_response();
    }

    state.accepted += records;
    let id_map: Vec<Value> = if state.assign_cloud_ids {
        data.records()
            .iter()
            .map(|record| {
                json!({
                    "table": record.kind().table(),
                    "id": record.meta().id,
                    "cloudId": record.meta().id + 1_000,
                })
            })
            .collect()
    } else {
        Vec::new()
    };
    Json(json!({
        "success": true,
        "merged": records,
        "conflicts": 0,
        "idMap": id_map,
    }))
    .into_response()
}

async fn hash(State(state): State<Shared>) -> Response {
    let state = state.lock().unwrap();
    if state.sync_disabled {
        return not_found();
    }
    match &state.hash {
        Some(hash) => Json(json!({ "hash": hash })).into_response(),
        None => not_found(),
    }
}

/// Count of records per kind in a pushed body
pub fn pushed_kinds(body: &Value) -> Vec<(EntityKind, usize)> {
    EntityKind::ALL
        .into_iter()
        .map(|kind| {
            let count = body["data"][kind.envelope_key()]
                .as_array()
                .map_or(0, Vec::len);
            (kind, count)
        })
        .filter(|(_, count)| *count > 0)
        .collect()
}
