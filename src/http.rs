//! HTTP control surface for scripted integration tests.
//!
//! Two endpoints, bound to loopback only: `POST /refreshReplication` runs a
//! reconciliation and answers once it finished, `POST /shutdown` asks the
//! daemon to stop and answers immediately.

use axum::{extract::State, http::StatusCode, routing::post, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::daemon::DaemonHandle;

/// Build the control-surface router.
pub fn router(handle: DaemonHandle) -> Router {
    Router::new()
        .route("/refreshReplication", post(refresh_replication))
        .route("/shutdown", post(shutdown))
        .with_state(handle)
}

/// Serve the control surface on `127.0.0.1:port` until the task is dropped.
pub async fn serve(port: u16, handle: DaemonHandle) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "control surface listening");
    axum::serve(listener, router(handle)).await
}

async fn refresh_replication(State(handle): State<DaemonHandle>) -> (StatusCode, &'static str) {
    if handle.refresh_replication().await {
        (StatusCode::OK, "ok\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "daemon gone\n")
    }
}

async fn shutdown(State(handle): State<DaemonHandle>) -> (StatusCode, &'static str) {
    handle.request_shutdown();
    (StatusCode::OK, "shutting down\n")
}
