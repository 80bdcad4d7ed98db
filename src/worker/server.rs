//! Worker binary assembly: wires C2-C7/C12/C13 together into one axum app
//! plus background tasks, mirroring the teacher's `networking::api::router`
//! + `tower_http` layering pattern.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::WorkerConfig;
use crate::memman::MemMan;
use crate::worker::blend::{BlendScheduler, BlendSchedulerConfig};
use crate::worker::gc::ResultFileGc;
use crate::worker::query_stats::QueriesAndChunks;
use crate::worker::rest::{self, WorkerState};
use crate::worker::runner::{self, RowSource};
use crate::worker::scheduler::{ScanScheduler, SchedulerConfig};
use crate::worker::status_client::{StatusClient, WorkerCancelSink, WorkerHealthSource};

pub struct WorkerApp {
    pub state: Arc<WorkerState>,
    pub router: Router,
}

fn build_lanes(cfg: &crate::config::SchedulerConfig, mem_man: Arc<MemMan>, stats: Arc<QueriesAndChunks>) -> Vec<Arc<ScanScheduler>> {
    let lane = |name: &str, priority: i32, reserve: usize, max_active: usize, rating: u8, minutes: f64| {
        ScanScheduler::new(
            SchedulerConfig {
                name: name.to_string(),
                max_threads: cfg.max_pool_threads as u32,
                max_reserve: reserve as u32,
                priority,
                max_active_chunks: max_active as u32,
                min_rating: rating,
                max_rating: rating,
                max_time_minutes: minutes,
            },
            mem_man.clone(),
            stats.clone(),
        )
    };
    vec![
        lane("fast", cfg.priority_fast, cfg.reserve_fast, cfg.maxactivechunks_fast, 1, cfg.scanmaxminutes_fast),
        lane("medium", cfg.priority_med, cfg.reserve_med, cfg.maxactivechunks_med, 2, cfg.scanmaxminutes_med),
        lane("slow", cfg.priority_slow, cfg.reserve_slow, cfg.maxactivechunks_slow, 3, cfg.scanmaxminutes_slow),
        lane("snail", cfg.priority_snail, cfg.reserve_snail, cfg.maxactivechunks_snail, 4, cfg.scanmaxminutes_snail),
    ]
}

struct BlendHealth {
    blend: Arc<BlendScheduler>,
    pool_size: u32,
}

impl WorkerHealthSource for BlendHealth {
    fn thread_pool_size(&self) -> u32 {
        self.pool_size
    }
    fn queue_size(&self) -> u32 {
        self.blend.lanes().iter().map(|l| l.get_size() as u32).sum()
    }
}

struct StateCancelSink {
    state: Arc<WorkerState>,
}

impl WorkerCancelSink for StateCancelSink {
    fn cancel_queries_at_or_below(&self, qid_threshold: i64) -> Vec<i64> {
        self.state.cancel_queries_at_or_below(qid_threshold)
    }
}

pub fn build(cfg: &WorkerConfig) -> WorkerApp {
    let mem_man = Arc::new(MemMan::new(cfg.memman.memory_mb * 1024 * 1024));
    let stats = Arc::new(QueriesAndChunks::new(cfg.scheduler.required_tasks_completed));
    let lanes = build_lanes(&cfg.scheduler, mem_man.clone(), stats.clone());
    let blend = Arc::new(BlendScheduler::new(
        BlendSchedulerConfig {
            max_tasks_booted_per_user_query: cfg.scheduler.maxtasksbootedperuserquery,
            max_concurrent_booted_tasks: cfg.scheduler.maxconcurrentbootedtasks,
        },
        lanes,
        stats,
    ));
    let results_dir = PathBuf::from(&cfg.results.dirname);
    let gc = Arc::new(ResultFileGc::new(&results_dir, Duration::from_secs(3600)));
    if cfg.results.clean_up_on_start {
        let _ = std::fs::create_dir_all(&results_dir);
        let _ = gc.clean_up_on_start();
    }

    let state = Arc::new(WorkerState::new(blend, mem_man, gc, results_dir));

    let router = rest::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(cfg.replication.registry_heartbeat_ival_sec.max(5) * 10)))
        .layer(CorsLayer::permissive());

    WorkerApp { state, router }
}

/// Spawns the C12 status-poll background task. Returns the join handle so
/// the binary can hold it open for the process lifetime.
pub fn spawn_status_client(
    worker_id: String,
    restart_epoch: u64,
    czar_base_url: String,
    state: Arc<WorkerState>,
    pool_size: u32,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let health = Arc::new(BlendHealth {
        blend: state.blend.clone(),
        pool_size,
    });
    let cancel_sink = Arc::new(StateCancelSink { state: state.clone() });
    let client = StatusClient::new(worker_id, restart_epoch, czar_base_url, state.gc.clone(), health, cancel_sink);
    tokio::spawn(async move {
        client.run_forever(poll_interval).await;
    })
}

/// Spawns the C6 execution loop on `pool_size` real OS threads, matching
/// spec.md section 5's "scan-lane thread pools are real OS threads": each
/// thread repeatedly pulls the next ready task off [`BlendScheduler`] (C5),
/// runs it (C6), and reports the outcome back to the czar via
/// `/queryjob-ready` or `/queryjob-error`.
///
/// There is no MariaDB client in this crate's scope, so tasks run against
/// [`runner::EmptyRowSource`] -- real row production is the next thing to
/// wire in once a storage engine client exists.
pub fn spawn_execution_loop(
    state: Arc<WorkerState>,
    pool_size: usize,
    czar_base_url: String,
    worker_base_url: String,
) -> Vec<std::thread::JoinHandle<()>> {
    let http = Arc::new(reqwest::blocking::Client::new());
    (0..pool_size.max(1))
        .map(|_| {
            let state = state.clone();
            let http = http.clone();
            let czar_base_url = czar_base_url.clone();
            let worker_base_url = worker_base_url.clone();
            std::thread::spawn(move || execution_loop(state, http, czar_base_url, worker_base_url))
        })
        .collect()
}

fn execution_loop(state: Arc<WorkerState>, http: Arc<reqwest::blocking::Client>, czar_base_url: String, worker_base_url: String) {
    loop {
        let Some((lane, task, handle)) = state.blend.get_cmd() else {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        };

        let outcome = runner::run_task(&task, &state.mem_man, handle, &state.results_dir, runner::EmptyRowSource::default());
        state.blend.command_finish(&lane, &task);

        let Some(uber_job_id) = task.uber_job_id else {
            continue;
        };

        match outcome {
            Ok(o) => {
                let file_name = o.result_path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                let body = serde_json::json!({
                    "query_id": task.query_id.0,
                    "uber_job_id": uber_job_id.0,
                    "row_count": o.row_count,
                    "file_size": o.byte_count,
                    "file_url": format!("{worker_base_url}/result/{file_name}"),
                });
                if let Err(e) = http.post(format!("{czar_base_url}/queryjob-ready")).json(&body).send() {
                    tracing::warn!(task = %task.id_str(), error = %e, "failed to report queryjob-ready to czar");
                }
            }
            Err(e) => {
                let body = serde_json::json!({
                    "query_id": task.query_id.0,
                    "uber_job_id": uber_job_id.0,
                    "code": "TASK_ERROR",
                    "msg": e.to_string(),
                });
                if let Err(send_err) = http.post(format!("{czar_base_url}/queryjob-error")).json(&body).send() {
                    tracing::warn!(task = %task.id_str(), error = %send_err, "failed to report queryjob-error to czar");
                }
            }
        }
    }
}

/// Spawns the C13 age-based GC sweep (trigger 2): anything in the results
/// directory older than the GC's configured `max_age` that the czar never
/// explicitly asked to delete, e.g. because it crashed mid-query.
pub fn spawn_gc_sweep(gc: Arc<ResultFileGc>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match gc.sweep_stale() {
                Ok(report) => {
                    if !report.deleted.is_empty() {
                        tracing::info!(count = report.deleted.len(), "gc swept stale result files");
                    }
                    for (path, err) in &report.errors {
                        tracing::warn!(?path, error = %err, "gc sweep error");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "gc sweep_stale failed"),
            }
        }
    })
}
