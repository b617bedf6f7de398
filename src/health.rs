//! Liveness endpoint
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn router() -> Router {
    Router::new().route("/ping", get(|| async { "pong" }))
}

/// Serves [router] on `listener` until `shutdown` is cancelled
pub async fn serve_on(listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr()?, "health endpoint listening");
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
