//! Czar binary assembly: wires C8/C10/C11/C14 plus the REST surface
//! together, mirroring `worker::server`'s layering.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::CzarConfig;
use crate::czar::rest::{self, CzarState};

pub struct CzarApp {
    pub state: Arc<CzarState>,
    pub router: Router,
}

pub fn build(cfg: &CzarConfig, czar_id: i64, restart_epoch: u64, restart_cancel_qid: Option<i64>) -> CzarApp {
    let state = Arc::new(CzarState::new(
        czar_id,
        restart_epoch,
        restart_cancel_qid,
        cfg.dispatch_pool_size,
        cfg.response_timeout_sec,
        cfg.evict_timeout_sec,
        cfg.status_max_lifetime_sec,
    ));

    let router = rest::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(cfg.response_timeout_sec.max(1) * 10)))
        .layer(CorsLayer::permissive());

    CzarApp { state, router }
}

/// Spawns the C14 periodic health-probe round: marks every known worker
/// silent for one tick, lets [`HealthMonitor::poll_round`] nominate at most
/// one eviction, reassigns that worker's outstanding uber-jobs across every
/// in-flight query, and prunes query executives nobody has touched in a
/// while (spec.md section 4.15, `ActiveWorker::_removeDeadEntries`).
pub fn spawn_health_monitor(state: Arc<CzarState>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            let known: Vec<_> = state.worker_urls.lock().keys().cloned().collect();
            state.health.mark_round_silent(&known);

            if let Some(evicted) = state.health.poll_round() {
                tracing::warn!(worker = %evicted, "worker evicted by health monitor");
                for exec in state.executives.all() {
                    for uj in exec.uber_jobs_for_worker(&evicted) {
                        if let Err(e) = exec.unassign_jobs(uj) {
                            tracing::warn!(uber_job_id = uj.0, error = %e, "failed to unassign uber-job for evicted worker");
                        }
                    }
                }
                state.health.remove(&evicted);
                state.worker_urls.lock().remove(&evicted);
            }

            let pruned = state.executives.prune_stale();
            if !pruned.is_empty() {
                tracing::info!(count = pruned.len(), "pruned stale query executives");
            }
        }
    })
}
