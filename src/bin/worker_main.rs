//! Worker process entry point: binds the axum app from `worker::server` and
//! runs the C12 status-poll loop alongside it.

use std::time::Duration;

use qserv_core::config::WorkerConfig;
use qserv_core::worker::server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).init();

    let cfg = WorkerConfig::default();
    tracing::info!(memman_mb = cfg.memman.memory_mb, "starting qserv worker");

    let app = server::build(&cfg);

    let worker_id = std::env::var("QSERV_WORKER_ID").unwrap_or_else(|_| "worker-1".to_string());
    let czar_base_url =
        std::env::var("QSERV_CZAR_URL").unwrap_or_else(|_| "http://localhost:25000".to_string());
    let worker_base_url = std::env::var("QSERV_WORKER_BASE_URL")
        .unwrap_or_else(|_| format!("http://localhost:{}", cfg.replication.http_port));
    let restart_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let _status_handle = server::spawn_status_client(
        worker_id.clone(),
        restart_epoch,
        czar_base_url.clone(),
        app.state.clone(),
        cfg.scheduler.thread_pool_size as u32,
        Duration::from_secs(1),
    );

    let _execution_handles = server::spawn_execution_loop(
        app.state.clone(),
        cfg.scheduler.thread_pool_size,
        czar_base_url.clone(),
        worker_base_url.clone(),
    );

    let _gc_handle = server::spawn_gc_sweep(app.state.gc.clone(), Duration::from_secs(300));

    // Best-effort self-registration so the czar's dispatcher knows this
    // worker's base URL; a restart races the czar's own polling loop either
    // way, so failure here is logged, not fatal.
    {
        let czar_base_url = czar_base_url.clone();
        let worker_id = worker_id.clone();
        let worker_base_url = worker_base_url.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let body = serde_json::json!({ "worker_id": worker_id, "base_url": worker_base_url });
            if let Err(e) = client.post(format!("{czar_base_url}/register-worker")).json(&body).send().await {
                tracing::warn!(error = %e, "failed to self-register with czar");
            }
        });
    }

    let addr = format!("0.0.0.0:{}", cfg.replication.http_port);
    tracing::info!(%addr, "worker HTTP listener starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.router).await?;

    Ok(())
}
