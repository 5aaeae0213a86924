//! Prometheus 指标
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! recorder 安装后由服务的运维端点渲染 `/metrics`。

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 安装全局 Prometheus recorder
///
/// 同一进程只能安装一次，重复调用返回已安装的 handle。
pub fn init(service_name: &str) -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(service_name);
    Ok(handle)
}

/// 获取全局 Prometheus handle
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// 这些描述会出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "notifications_published_total",
        "Total number of notifications appended to the broker"
    );
    metrics::describe_counter!(
        "notifications_processed_total",
        "Total number of notifications consumed, by outcome"
    );
    metrics::describe_histogram!(
        "notification_processing_duration_seconds",
        "End-to-end processing time of one notification"
    );
    metrics::describe_counter!(
        "notification_delivery_attempts_total",
        "Total number of channel delivery attempts"
    );
    metrics::describe_counter!(
        "notification_broker_errors_total",
        "Total number of broker poll errors"
    );
    metrics::describe_gauge!(
        "notification_active_workers",
        "Number of workers currently consuming"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 记录发布结果
#[inline]
pub fn record_publish(notification_type: &str, status: &str) {
    metrics::counter!(
        "notifications_published_total",
        "type" => notification_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录一条消息的最终处理结果
#[inline]
pub fn record_processed(outcome: &str, elapsed: Duration) {
    metrics::counter!(
        "notifications_processed_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "notification_processing_duration_seconds",
        "outcome" => outcome.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// 记录一次渠道投递尝试
#[inline]
pub fn record_delivery_attempt(channel: &str, outcome: &str) {
    metrics::counter!(
        "notification_delivery_attempts_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_broker_error() {
    metrics::counter!("notification_broker_errors_total").increment(1);
}

#[inline]
pub fn set_active_workers(count: usize) {
    metrics::gauge!("notification_active_workers").set(count as f64);
}
