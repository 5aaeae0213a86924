//! 运维端点
//!
//! - `GET /health`：健康返回 200，否则 503，响应体为健康状态 JSON
//! - `GET /stats`：消费端指标快照
//! - `GET /metrics`：Prometheus 文本格式指标

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use notify_shared::observability::metrics as prom;
use tracing::info;

use crate::metrics::MetricsSnapshot;
use crate::service::NotificationService;

pub fn router(service: Arc<NotificationService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .with_state(service)
}

/// 在 `addr` 上提供运维端点，`shutdown` 完成后优雅退出
pub async fn serve(
    addr: SocketAddr,
    service: Arc<NotificationService>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "运维端点已监听");

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(service): State<Arc<NotificationService>>) -> impl IntoResponse {
    let status = service.health_check();
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

async fn stats(State(service): State<Arc<NotificationService>>) -> Json<MetricsSnapshot> {
    Json(service.metrics())
}

async fn metrics() -> impl IntoResponse {
    match prom::get_handle() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics exporter not initialized".to_string(),
        ),
    }
}
