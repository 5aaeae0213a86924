//! 通知投递服务入口
//!
//! 加载配置、初始化可观测性、连接 Kafka 启动工作池，并在指标端口上提供运维端点。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use notification_service::{NotificationService, ops};
use notify_shared::config::AppConfig;
use notify_shared::observability;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "notification-service";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置，失败时退回默认值
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("加载配置失败，使用默认配置: {e}");
        AppConfig::default()
    });

    // 2. 初始化日志与指标
    let _guard = observability::init(&config.service_name, &config.observability)?;

    info!(
        environment = %config.environment,
        brokers = %config.kafka.brokers,
        topic = %config.kafka.topic,
        workers = config.worker.worker_count,
        "Starting notification-service..."
    );

    if let Err(problems) = config.validate() {
        for problem in &problems {
            error!(problem = %problem, "配置校验失败");
        }
        anyhow::bail!("配置校验失败: {}", problems.join("; "));
    }

    // 3. 连接 Kafka 并启动工作池
    let service = Arc::new(
        NotificationService::with_kafka(config.clone()).context("初始化通知服务失败")?,
    );
    service.start().context("启动通知服务失败")?;

    // 4. 运维端点
    let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
    let (ops_tx, ops_rx) = oneshot::channel::<()>();
    let ops_handle = tokio::spawn(ops::serve(addr, service.clone(), async {
        let _ = ops_rx.await;
    }));

    shutdown_signal().await;

    // 5. 先停止消费，再关闭运维端点
    service.stop().await;
    let _ = ops_tx.send(());
    match ops_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "运维端点异常退出"),
        Err(e) => warn!(error = %e, "运维端点任务异常"),
    }

    info!("Service shutdown complete");
    Ok(())
}

/// 监听 Ctrl+C 和 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "监听 Ctrl+C 失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "监听 SIGTERM 失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
