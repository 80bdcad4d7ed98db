//! Czar process entry point: binds the axum app from `czar::server` and runs
//! the C14 health-monitor loop alongside it.

use std::time::Duration;

use qserv_core::config::CzarConfig;
use qserv_core::czar::server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).init();

    let cfg = CzarConfig::default();
    let czar_id = std::env::var("QSERV_CZAR_ID").ok().and_then(|s| s.parse().ok()).unwrap_or(1);
    let restart_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let restart_cancel_qid = std::env::var("QSERV_CZAR_RESTART_CANCEL_QID").ok().and_then(|s| s.parse().ok());

    tracing::info!(name = %cfg.name, czar_id, restart_epoch, ?restart_cancel_qid, "starting qserv czar");

    let app = server::build(&cfg, czar_id, restart_epoch, restart_cancel_qid);

    let _health_handle = server::spawn_health_monitor(
        app.state.clone(),
        Duration::from_secs_f64(cfg.status_interval_sec.max(0.1)),
    );

    let addr = format!("0.0.0.0:{}", cfg.replication.http_port);
    tracing::info!(%addr, "czar HTTP listener starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.router).await?;

    Ok(())
}
