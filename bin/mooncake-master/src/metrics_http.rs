//! HTTP metrics exposition
//!
//! Serves the master's counters in Prometheus text format, plus a
//! trivial health probe.

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use mooncake_store::MasterService;
use std::sync::Arc;

async fn metrics_handler(State(master): State<Arc<MasterService>>) -> String {
    let key_count = master.key_count() as u64;
    master.metrics().render_prometheus(key_count)
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Serve `/metrics` and `/health` on `0.0.0.0:{port}` until the process
/// exits.
pub async fn serve(port: u16, master: Arc<MasterService>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(master);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
