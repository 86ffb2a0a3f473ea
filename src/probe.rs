//! HTTP liveness probe for the responder.

use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{AppError, Result};

/// Handler for `GET /health`: 200 with a plain-text body.
async fn health() -> &'static str {
    "ok"
}

/// Routes served by the probe.
#[must_use]
pub fn probe_router() -> axum::Router {
    axum::Router::new().route("/health", get(health))
}

/// Serve the probe on `listener` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Transport` if the HTTP server fails.
pub async fn serve_probe(listener: TcpListener, ct: CancellationToken) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|err| AppError::Transport(format!("probe listener has no address: {err}")))?;
    info!(%addr, "starting HTTP liveness probe");

    axum::serve(listener, probe_router())
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Transport(format!("probe server error: {err}")))?;

    info!("HTTP liveness probe shut down");
    Ok(())
}
