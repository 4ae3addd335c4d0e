//! Stats HTTP endpoint
//!
//! - `GET /metrics`: Prometheus text format
//! - `GET /api/sites`: current site statistics snapshot as JSON

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::detour::SiteStatistics;
use crate::metrics::REGISTRY;

/// Prometheus metrics endpoint
async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn get_sites(State(stats): State<Arc<SiteStatistics>>) -> impl IntoResponse {
    Json(stats.snapshot())
}

/// Build the API router
pub fn build_api_router(stats: Arc<SiteStatistics>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/api/sites", get(get_sites))
        .with_state(stats)
}

/// Serve the API until shutdown
pub async fn start_api_server(
    addr: SocketAddr,
    stats: Arc<SiteStatistics>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let app = build_api_router(stats);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind stats API to {}: {}", addr, e);
            return;
        }
    };

    info!("Stats API listening on http://{} (/metrics, /api/sites)", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Stats API shutting down");
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Stats API error: {}", e);
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_api_endpoints() {
        crate::metrics::init_metrics();
        let stats = Arc::new(SiteStatistics::new());
        stats.record_proxy_success("blocked.example");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_api_router(stats.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let sites = http_get(addr, "/api/sites").await;
        assert!(sites.starts_with("HTTP/1.1 200"));
        assert!(sites.contains(r#""blocked.example":{"direct":0,"block":1"#));

        let metrics = http_get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"));
        assert!(metrics.contains("detour_hosts_tracked"));
    }
}
