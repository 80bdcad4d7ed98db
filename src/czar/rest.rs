//! Czar HTTP endpoints. Two families: the worker-facing `queryjob-ready` /
//! `queryjob-error` / C12 `worker-status` round-trip, and the submission
//! surface (`submit-query`, `chunk-map`, `register-worker`) that drives C8's
//! chunk-map consumer side and C9/C10's dispatch loop. Grounded in spec.md
//! sections 4.7-4.9, 4.13 and the teacher's `networking::api` handler style.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::czar::chunk_map::ChunkMap;
use crate::czar::dispatch::Dispatcher;
use crate::czar::executive::{ExecutiveRegistry, QueryExecutive};
use crate::czar::health::HealthMonitor;
use crate::czar::uberjob::SubQueryDescriptor;
use crate::error::{QservError, Result};
use crate::ids::{JobId, QueryId, UberJobId, WorkerId};
use crate::status::{CzarContactInfo, ResultDisposition, WorkerContactInfo};
use crate::task::ScanRating;

pub struct CzarState {
    pub czar_id: i64,
    pub restart_epoch: u64,
    /// Highest query id assigned by the czar process this one replaced, if
    /// any. Workers still carrying tasks/result files for queries at or
    /// below this id predate the restart and must drop them (spec.md
    /// boundary scenario "czar restart").
    pub restart_cancel_qid: Option<i64>,
    pub executives: Arc<ExecutiveRegistry>,
    pub health: Arc<HealthMonitor>,
    pub dispatcher: Arc<Dispatcher>,
    /// C8's consumer-side chunk map. Populated externally via `/chunk-map`
    /// -- producing it is the replication/placement control plane's job,
    /// out of scope here (spec.md section 1).
    pub chunk_map: Mutex<ChunkMap>,
    pub worker_urls: Mutex<HashMap<WorkerId, String>>,
    next_query_id: AtomicI64,
    next_uber_job_id: Mutex<i64>,
}

impl CzarState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        czar_id: i64,
        restart_epoch: u64,
        restart_cancel_qid: Option<i64>,
        dispatch_pool_size: usize,
        response_timeout_sec: u64,
        evict_timeout_sec: u64,
        status_max_lifetime_sec: f64,
    ) -> Self {
        Self {
            czar_id,
            restart_epoch,
            restart_cancel_qid,
            executives: Arc::new(ExecutiveRegistry::with_max_lifetime(Duration::from_secs_f64(
                status_max_lifetime_sec.max(1.0),
            ))),
            health: Arc::new(HealthMonitor::new(response_timeout_sec, evict_timeout_sec)),
            dispatcher: Arc::new(Dispatcher::new(dispatch_pool_size)),
            chunk_map: Mutex::new(ChunkMap::default()),
            worker_urls: Mutex::new(HashMap::new()),
            next_query_id: AtomicI64::new(1),
            next_uber_job_id: Mutex::new(1),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryJobReadyRequest {
    pub query_id: i64,
    pub uber_job_id: i64,
    pub row_count: u64,
    pub file_size: u64,
    pub file_url: String,
}

#[derive(Debug, Deserialize)]
pub struct QueryJobErrorRequest {
    pub query_id: i64,
    pub uber_job_id: i64,
    pub code: String,
    pub msg: String,
}

#[derive(Debug, Serialize)]
pub struct SimpleResponse {
    pub success: u8,
}

/// One chunk's worth of already-planned sub-query, as POSTed to
/// `/submit-query`. SQL parsing/logical planning produced this shape
/// upstream of the czar (spec.md section 1 Non-goals); the czar's job
/// starts at worker selection (C8).
#[derive(Debug, Deserialize)]
pub struct SubmitScanTableSpec {
    pub db: String,
    pub table: String,
    pub scan_rating: u8,
    pub lock_in_memory: bool,
}

#[derive(Debug, Deserialize)]
pub struct SubmitChunkSpec {
    pub job_id: i64,
    pub chunk_id: i64,
    #[serde(default)]
    pub subchunk_ids: Vec<i64>,
    pub templates: Vec<String>,
    pub tables: Vec<(String, String)>,
    pub scan_tables: Vec<SubmitScanTableSpec>,
    #[serde(default)]
    pub interactive: bool,
    pub max_result_table_bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct SubmitQueryRequest {
    pub max_attempts: u32,
    #[serde(default)]
    pub limit: Option<u64>,
    pub chunks: Vec<SubmitChunkSpec>,
}

#[derive(Debug, Serialize)]
pub struct SubmitQueryResponse {
    pub success: u8,
    pub query_id: i64,
    pub uber_job_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkMapRequest {
    pub layout: HashMap<WorkerId, HashMap<String, HashMap<String, Vec<(i64, u64)>>>>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: WorkerId,
    pub base_url: String,
}

pub fn router(state: Arc<CzarState>) -> Router {
    Router::new()
        .route("/queryjob-ready", post(post_queryjob_ready))
        .route("/queryjob-error", post(post_queryjob_error))
        .route("/worker-status", post(post_worker_status))
        .route("/submit-query", post(post_submit_query))
        .route("/chunk-map", post(post_chunk_map))
        .route("/register-worker", post(post_register_worker))
        .with_state(state)
}

fn scan_rating_from_u8(v: u8) -> ScanRating {
    match v {
        1 => ScanRating::Fast,
        2 => ScanRating::Medium,
        3 => ScanRating::Slow,
        _ => ScanRating::Snail,
    }
}

/// C10's submission entry point: turns an already-planned set of per-chunk
/// sub-queries into a dispatch round (C8 worker selection -> C9 uber-job
/// assembly -> register with a fresh [`QueryExecutive`] -> POST to each
/// worker's `/queryjob`).
async fn post_submit_query(
    State(state): State<Arc<CzarState>>,
    Json(req): Json<SubmitQueryRequest>,
) -> Result<Json<SubmitQueryResponse>> {
    let query_id = QueryId(state.next_query_id.fetch_add(1, Ordering::Relaxed));
    let exec = Arc::new(QueryExecutive::new(query_id, req.max_attempts, req.limit));
    for c in &req.chunks {
        exec.add_job(JobId(c.job_id), c.chunk_id);
    }
    state.executives.insert(exec.clone());

    let descriptors = req
        .chunks
        .into_iter()
        .map(|c| {
            let chunk_id = c.chunk_id;
            let desc = SubQueryDescriptor {
                job_id: JobId(c.job_id),
                chunk_id,
                subchunk_ids: c.subchunk_ids,
                templates: c.templates,
                tables: c.tables,
                scan_tables: c
                    .scan_tables
                    .into_iter()
                    .map(|s| (s.db, s.table, scan_rating_from_u8(s.scan_rating), s.lock_in_memory))
                    .collect(),
                interactive: c.interactive,
                max_result_table_bytes: c.max_result_table_bytes,
            };
            (chunk_id, desc)
        })
        .collect();

    let map = state.chunk_map.lock().clone();
    let worker_urls = state.worker_urls.lock().clone();
    let mut next_id = *state.next_uber_job_id.lock();
    let ids = state
        .dispatcher
        .dispatch_round(&exec, &map, &worker_urls, descriptors, &mut next_id)
        .await?;
    *state.next_uber_job_id.lock() = next_id;

    Ok(Json(SubmitQueryResponse {
        success: 1,
        query_id: query_id.0,
        uber_job_ids: ids.into_iter().map(|u| u.0).collect(),
    }))
}

/// Replaces the consumer-side chunk map (C8) wholesale. The replication
/// control plane producing this layout is out of scope; this endpoint is
/// the seam an external operator or test harness feeds it through.
async fn post_chunk_map(
    State(state): State<Arc<CzarState>>,
    Json(req): Json<ChunkMapRequest>,
) -> Result<Json<SimpleResponse>> {
    let map = ChunkMap::from_layout(&req.layout);
    map.verify()?;
    *state.chunk_map.lock() = map;
    Ok(Json(SimpleResponse { success: 1 }))
}

async fn post_register_worker(
    State(state): State<Arc<CzarState>>,
    Json(req): Json<RegisterWorkerRequest>,
) -> Json<SimpleResponse> {
    state.worker_urls.lock().insert(req.worker_id, req.base_url);
    Json(SimpleResponse { success: 1 })
}

async fn post_queryjob_ready(
    State(state): State<Arc<CzarState>>,
    Json(req): Json<QueryJobReadyRequest>,
) -> Result<Json<SimpleResponse>> {
    let exec = state
        .executives
        .get(QueryId(req.query_id))
        .ok_or_else(|| QservError::NotFound(format!("query {}", req.query_id)))?;
    exec.on_uber_job_ready(UberJobId(req.uber_job_id), req.row_count)?;
    tracing::debug!(
        query_id = req.query_id,
        uber_job_id = req.uber_job_id,
        file_url = %req.file_url,
        file_size = req.file_size,
        "uber-job ready"
    );
    Ok(Json(SimpleResponse { success: 1 }))
}

async fn post_queryjob_error(
    State(state): State<Arc<CzarState>>,
    Json(req): Json<QueryJobErrorRequest>,
) -> Result<Json<SimpleResponse>> {
    let exec = state
        .executives
        .get(QueryId(req.query_id))
        .ok_or_else(|| QservError::NotFound(format!("query {}", req.query_id)))?;
    tracing::warn!(query_id = req.query_id, uber_job_id = req.uber_job_id, code = %req.code, msg = %req.msg, "worker reported queryjob error");
    exec.unassign_jobs(UberJobId(req.uber_job_id))?;
    Ok(Json(SimpleResponse { success: 1 }))
}

async fn post_worker_status(
    State(state): State<Arc<CzarState>>,
    Json(req): Json<WorkerContactInfo>,
) -> Json<CzarContactInfo> {
    state.health.query_responded(&req.worker_id);
    state.health.replication_responded(&req.worker_id);

    if !req.cancelled_qids.is_empty() {
        tracing::info!(worker_id = %req.worker_id, cancelled = ?req.cancelled_qids, "worker confirmed pre-restart cancellation");
    }

    let mut reply = CzarContactInfo::new(state.czar_id, state.restart_epoch);
    reply.czar_restart_cancel_qid = state.restart_cancel_qid;
    for exec in state.executives.all() {
        let disposition = if exec.all_uber_jobs_done_or_failed() || exec.limit_row_complete() {
            ResultDisposition::DeleteFiles
        } else {
            ResultDisposition::KeepFiles
        };
        reply.add_query(exec.query_id, disposition);
        for uj in exec.dead_uber_jobs() {
            reply.add_dead_uberjob(uj);
        }
    }
    Json(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn mk_state() -> Arc<CzarState> {
        Arc::new(CzarState::new(1, 0, None, 2, 5, 10, 300.0))
    }

    #[tokio::test]
    async fn queryjob_ready_updates_executive() {
        let state = mk_state();
        let exec = Arc::new(QueryExecutive::new(QueryId(1), 3, None));
        exec.add_job(crate::ids::JobId(1), 6630);
        exec.register_uber_job(UberJobId(7), "worker-a".to_string(), vec![crate::ids::JobId(1)]);
        state.executives.insert(exec.clone());

        let app = router(state);
        let body = serde_json::json!({
            "query_id": 1,
            "uber_job_id": 7,
            "row_count": 42,
            "file_size": 1024,
            "file_url": "http://worker-a/result/x"
        });
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/queryjob-ready")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
        assert_eq!(exec.result_rows(), 42);
    }

    #[tokio::test]
    async fn worker_status_reports_keep_for_in_flight_query() {
        let state = mk_state();
        let exec = Arc::new(QueryExecutive::new(QueryId(5), 3, None));
        exec.add_job(crate::ids::JobId(1), 6630);
        exec.register_uber_job(UberJobId(9), "worker-a".to_string(), vec![crate::ids::JobId(1)]);
        state.executives.insert(exec);

        let app = router(state);
        let body = serde_json::json!({
            "worker_id": "worker-a",
            "worker_restart_epoch": 0,
            "thread_pool_size": 8,
            "queue_size": 0,
            "acknowledged_dead_uberjobs": []
        });
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/worker-status")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let reply: CzarContactInfo = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply.qid_done_keep_files, vec![5]);
    }

    #[tokio::test]
    async fn worker_status_reports_restart_cancel_threshold() {
        let state = Arc::new(CzarState::new(1, 42, Some(500), 2, 5, 10, 300.0));

        let app = router(state);
        let body = serde_json::json!({
            "worker_id": "worker-a",
            "worker_restart_epoch": 0,
            "thread_pool_size": 8,
            "queue_size": 0,
            "acknowledged_dead_uberjobs": [],
            "cancelled_qids": []
        });
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/worker-status")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let reply: CzarContactInfo = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply.czar_restart_epoch, 42);
        assert_eq!(reply.czar_restart_cancel_qid, Some(500));
    }

    #[tokio::test]
    async fn submit_query_fails_cleanly_with_no_chunk_map() {
        let state = mk_state();
        let app = router(state.clone());
        let body = serde_json::json!({
            "max_attempts": 3,
            "limit": null,
            "chunks": [{
                "job_id": 1,
                "chunk_id": 6630,
                "subchunk_ids": [],
                "templates": ["SELECT * FROM %T%;"],
                "tables": [["LSST", "Object"]],
                "scan_tables": [{"db": "LSST", "table": "Object", "scan_rating": 1, "lock_in_memory": true}],
                "interactive": false,
                "max_result_table_bytes": 1048576
            }]
        });
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/submit-query")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        // No chunk map registered yet: chunk 6630 has no candidates.
        assert_ne!(resp.status(), axum::http::StatusCode::OK);
        assert!(state.executives.all().len() == 1, "executive is created before dispatch is attempted");
    }

    #[tokio::test]
    async fn chunk_map_and_register_worker_then_submit_query_dispatches() {
        let state = mk_state();
        let app = router(state.clone());

        let layout = serde_json::json!({
            "layout": {
                "worker-a": {"LSST": {"Object": [[6630, 100]]}}
            }
        });
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/chunk-map")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(serde_json::to_vec(&layout).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);

        // No worker URL registered: dispatch should fail with Configuration,
        // surfaced as a non-2xx response, but the executive + uber-job
        // registration must already have happened.
        let body = serde_json::json!({
            "max_attempts": 3,
            "chunks": [{
                "job_id": 1,
                "chunk_id": 6630,
                "templates": ["SELECT * FROM %T%;"],
                "tables": [["LSST", "Object"]],
                "scan_tables": [{"db": "LSST", "table": "Object", "scan_rating": 1, "lock_in_memory": true}],
                "max_result_table_bytes": 1048576
            }]
        });
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/submit-query")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(resp.status(), axum::http::StatusCode::OK);
        assert!(state.executives.get(QueryId(1)).is_some(), "executive is registered before the POST to the worker is attempted");
    }
}
