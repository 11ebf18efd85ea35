use crate::coordinator::InverterHandle;
use axum::{Json, Router, http::StatusCode, http::header, response::IntoResponse, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serves `/metrics` (Prometheus text) and `/diagnostics` (JSON snapshot).
pub struct MetricsServer {
    registry: Arc<Registry>,
    handle: InverterHandle,
    port: u16,
    cancel: CancellationToken,
}

impl MetricsServer {
    pub fn new(
        registry: Arc<Registry>,
        handle: InverterHandle,
        port: u16,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            handle,
            port,
            cancel,
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let registry = self.registry;
        let handle = self.handle;
        let app = Router::new()
            .route(
                "/metrics",
                get(move || {
                    let registry = registry.clone();
                    async move { metrics_handler(registry) }
                }),
            )
            .route(
                "/diagnostics",
                get(move || {
                    let handle = handle.clone();
                    async move { diagnostics_handler(handle).await }
                }),
            );

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Metrics server listening on http://{}/metrics", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await?;

        tracing::info!("Metrics server stopped");
        Ok(())
    }
}

fn metrics_handler(registry: Arc<Registry>) -> impl IntoResponse {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &registry) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response();
    }

    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

async fn diagnostics_handler(handle: InverterHandle) -> impl IntoResponse {
    match handle.diagnostics().await {
        Ok(diagnostics) => Json(diagnostics).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}
