//! 统一可观测性模块
//!
//! 提供 logging 与 metrics 的统一初始化。
//! 所有进程通过单一入口点配置可观测性，确保一致的日志格式和指标命名。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::ObservabilityConfig;

/// 可观测性资源守卫
///
/// 持有 Prometheus handle，运维端点通过它渲染指标。
pub struct ObservabilityGuard {
    metrics_handle: Option<PrometheusHandle>,
}

impl ObservabilityGuard {
    /// 创建一个空的 Guard（用于测试或禁用可观测性时）
    pub fn empty() -> Self {
        Self {
            metrics_handle: None,
        }
    }

    pub fn metrics_handle(&self) -> Option<&PrometheusHandle> {
        self.metrics_handle.as_ref()
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        info!("Shutting down observability...");
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（日志）
/// 2. Metrics（Prometheus recorder，可通过配置关闭）
///
/// # Example
///
/// ```ignore
/// use notify_shared::{config::AppConfig, observability};
///
/// let config = AppConfig::load("notification-service")?;
/// let _guard = observability::init(&config.service_name, &config.observability)?;
/// ```
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    tracing::init(config)?;

    let metrics_handle = if config.metrics_enabled {
        Some(metrics::init(service_name)?)
    } else {
        None
    };

    info!(
        service = %service_name,
        metrics_enabled = config.metrics_enabled,
        metrics_port = config.metrics_port,
        json_logs = config.json_logs,
        "Observability initialized"
    );

    Ok(ObservabilityGuard { metrics_handle })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_guard_has_no_handle() {
        let guard = ObservabilityGuard::empty();
        assert!(guard.metrics_handle().is_none());
    }
}
