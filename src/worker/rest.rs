//! C7: worker status/command HTTP endpoint. Grounded in
//! `examples/original_source/src/http/WorkerQueryStatusData.cc` (the worker's
//! `/queryjob*` family and status JSON shape) and the teacher's
//! `networking::api` route-table style (one handler per route, `AppState`
//! via `axum::extract::State`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs as tokio_fs;

use crate::error::{QservError, Result};
use crate::ids::{CzarId, JobId, QueryId, UberJobId};
use crate::memman::MemMan;
use crate::task::{ChunkCoords, ScanRating, ScanTableRef, Task, TaskId};
use crate::worker::blend::BlendScheduler;
use crate::worker::gc::ResultFileGc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTableSpec {
    pub db: String,
    pub table: String,
    pub scan_rating: u8,
    pub lock_in_memory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub job_id: i64,
    pub chunk_id: i64,
    pub subchunk_id: i64,
    pub template_id: u32,
    pub tables: Vec<(String, String)>,
    pub scan_tables: Vec<ScanTableSpec>,
    pub interactive: bool,
    pub max_result_table_bytes: u64,
}

/// Built by the czar's [`crate::czar::dispatch::Dispatcher`] and POSTed to
/// this worker's `/queryjob` route -- the one spot this type crosses from
/// wire-deserialized (worker side) to wire-serialized (czar side).
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryJobRequest {
    pub query_id: i64,
    pub uber_job_id: i64,
    pub czar_id: i64,
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Serialize)]
pub struct QueryJobResponse {
    pub success: u8,
    pub queued_tasks: usize,
}

#[derive(Debug, Serialize)]
pub struct UberJobStatusResponse {
    pub success: u8,
    pub total: usize,
    pub finished: usize,
    pub cancelled: usize,
}

#[derive(Debug, Serialize)]
pub struct SimpleResponse {
    pub success: u8,
}

#[derive(Debug, Serialize, Default)]
pub struct WorkerStatusResponse {
    pub success: u8,
    pub lanes: Vec<LaneStatus>,
}

#[derive(Debug, Serialize)]
pub struct LaneStatus {
    pub name: String,
    pub in_flight: u32,
    pub queued: usize,
}

pub struct WorkerState {
    pub blend: Arc<BlendScheduler>,
    pub mem_man: Arc<MemMan>,
    pub gc: Arc<ResultFileGc>,
    pub results_dir: PathBuf,
    next_task_id: AtomicU64,
    uberjobs: DashMap<UberJobId, Vec<Arc<Task>>>,
}

impl WorkerState {
    pub fn new(blend: Arc<BlendScheduler>, mem_man: Arc<MemMan>, gc: Arc<ResultFileGc>, results_dir: PathBuf) -> Self {
        Self {
            blend,
            mem_man,
            gc,
            results_dir,
            next_task_id: AtomicU64::new(1),
            uberjobs: DashMap::new(),
        }
    }

    fn alloc_task_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Cancels every tracked task whose query id is `<= qid_threshold`,
    /// returning the distinct query ids that had something cancelled. Used
    /// after a czar restart to claw back work the new czar process no
    /// longer recognizes.
    pub fn cancel_queries_at_or_below(&self, qid_threshold: i64) -> Vec<i64> {
        let mut cancelled = std::collections::HashSet::new();
        for entry in self.uberjobs.iter() {
            for task in entry.value() {
                if task.query_id.0 <= qid_threshold && task.cancel() {
                    cancelled.insert(task.query_id.0);
                    self.blend.remove_task(task.id);
                }
            }
        }
        cancelled.into_iter().collect()
    }
}

pub fn router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/queryjob", post(post_queryjob))
        .route("/queryjob-status/{uber_job_id}", get(get_queryjob_status))
        .route("/queryjob-cancel/{uber_job_id}", post(post_queryjob_cancel))
        .route("/status", get(get_status))
        .route("/result/{name}", get(get_result))
        .with_state(state)
}

async fn post_queryjob(
    State(state): State<Arc<WorkerState>>,
    Json(req): Json<QueryJobRequest>,
) -> Result<Json<QueryJobResponse>> {
    let uber_job_id = UberJobId(req.uber_job_id);
    let query_id = QueryId(req.query_id);
    let czar_id = CzarId(req.czar_id);

    let mut tasks = Vec::with_capacity(req.tasks.len());
    for (idx, spec) in req.tasks.into_iter().enumerate() {
        let scan_tables: Vec<ScanTableRef> = spec
            .scan_tables
            .into_iter()
            .map(|s| ScanTableRef {
                db: s.db,
                table: s.table,
                scan_rating: match s.scan_rating {
                    1 => ScanRating::Fast,
                    2 => ScanRating::Medium,
                    3 => ScanRating::Slow,
                    _ => ScanRating::Snail,
                },
                lock_in_memory: s.lock_in_memory,
            })
            .collect();
        let mut task = Task::new(
            state.alloc_task_id(),
            query_id,
            JobId(spec.job_id),
            ChunkCoords {
                chunk_id: spec.chunk_id,
                subchunk_id: spec.subchunk_id,
            },
            spec.template_id,
            spec.tables,
            scan_tables,
            spec.interactive,
            spec.max_result_table_bytes,
            czar_id,
        );
        task.uber_job_id = Some(uber_job_id);
        task.fragment_index = idx;
        tasks.push(Arc::new(task));
    }

    for t in &tasks {
        state.blend.queue_task(t.clone());
    }
    let queued = tasks.len();
    state.uberjobs.insert(uber_job_id, tasks);

    Ok(Json(QueryJobResponse {
        success: 1,
        queued_tasks: queued,
    }))
}

async fn get_queryjob_status(
    State(state): State<Arc<WorkerState>>,
    AxumPath(uber_job_id): AxumPath<i64>,
) -> Result<Json<UberJobStatusResponse>> {
    let tasks = state
        .uberjobs
        .get(&UberJobId(uber_job_id))
        .ok_or_else(|| QservError::NotFound(format!("uber-job {uber_job_id}")))?;
    let total = tasks.len();
    let finished = tasks.iter().filter(|t| t.is_finished()).count();
    let cancelled = tasks.iter().filter(|t| t.is_cancelled()).count();
    Ok(Json(UberJobStatusResponse {
        success: 1,
        total,
        finished,
        cancelled,
    }))
}

async fn post_queryjob_cancel(
    State(state): State<Arc<WorkerState>>,
    AxumPath(uber_job_id): AxumPath<i64>,
) -> Result<Json<SimpleResponse>> {
    let tasks = state
        .uberjobs
        .get(&UberJobId(uber_job_id))
        .ok_or_else(|| QservError::NotFound(format!("uber-job {uber_job_id}")))?;
    for t in tasks.iter() {
        t.cancel();
        state.blend.remove_task(t.id);
    }
    Ok(Json(SimpleResponse { success: 1 }))
}

async fn get_status(State(state): State<Arc<WorkerState>>) -> Json<WorkerStatusResponse> {
    let lanes = state
        .blend
        .lanes()
        .iter()
        .map(|l| LaneStatus {
            name: l.name().to_string(),
            in_flight: l.in_flight(),
            queued: l.get_size(),
        })
        .collect();
    Json(WorkerStatusResponse { success: 1, lanes })
}

async fn get_result(
    State(state): State<Arc<WorkerState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Vec<u8>> {
    if name.contains("..") || name.contains('/') {
        return Err(QservError::InvalidArgument("invalid result file name".to_string()));
    }
    let path = state.results_dir.join(name);
    tokio_fs::read(&path)
        .await
        .map_err(|e| QservError::NotFound(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::blend::BlendSchedulerConfig;
    use crate::worker::query_stats::QueriesAndChunks;
    use crate::worker::scheduler::{ScanScheduler, SchedulerConfig};
    use tower::ServiceExt;

    fn mk_state() -> Arc<WorkerState> {
        let mem_man = Arc::new(MemMan::new(1 << 30));
        let stats = Arc::new(QueriesAndChunks::new(3));
        let fast = ScanScheduler::new(
            SchedulerConfig {
                name: "fast".into(),
                max_threads: 4,
                max_reserve: 1,
                priority: 0,
                max_active_chunks: 4,
                min_rating: 1,
                max_rating: 1,
                max_time_minutes: 5.0,
            },
            mem_man.clone(),
            stats.clone(),
        );
        let blend = Arc::new(BlendScheduler::new(
            BlendSchedulerConfig {
                max_tasks_booted_per_user_query: 3,
                max_concurrent_booted_tasks: 10,
            },
            vec![fast],
            stats,
        ));
        let dir = tempfile::tempdir().unwrap();
        let gc = Arc::new(ResultFileGc::new(dir.path(), std::time::Duration::from_secs(3600)));
        Arc::new(WorkerState::new(blend, mem_man, gc, dir.into_path()))
    }

    #[tokio::test]
    async fn submit_then_status_then_cancel() {
        let state = mk_state();
        let app = router(state);

        let req_body = serde_json::json!({
            "query_id": 1,
            "uber_job_id": 7,
            "czar_id": 1,
            "tasks": [{
                "job_id": 1,
                "chunk_id": 6630,
                "subchunk_id": -1,
                "template_id": 0,
                "tables": [["LSST", "Object"]],
                "scan_tables": [{"db": "LSST", "table": "Object_6630", "scan_rating": 1, "lock_in_memory": true}],
                "interactive": false,
                "max_result_table_bytes": 1048576
            }]
        });

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/queryjob")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(serde_json::to_vec(&req_body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/queryjob-status/7")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/queryjob-cancel/7")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }
}
