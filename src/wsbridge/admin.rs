use std::time::Duration;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(handle)
        .layer(TraceLayer::new_for_http())
}

/// Serves `/metrics` and `/health` on `ln` until `shutdown` flips to true.
pub async fn serve_with_shutdown(
    ln: TcpListener,
    handle: PrometheusHandle,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let upkeep = {
        let handle = handle.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(UPKEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => handle.run_upkeep(),
                }
            }
        })
    };

    if let Ok(addr) = ln.local_addr() {
        tracing::info!(metrics_addr = %addr, "admin: listening");
    }

    let res = axum::serve(ln, router(handle))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

    upkeep.abort();
    res?;
    tracing::info!("admin: stopped");
    Ok(())
}

async fn metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        handle.render(),
    )
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
