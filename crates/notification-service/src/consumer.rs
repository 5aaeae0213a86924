//! 消费者工作池
//!
//! 固定数量的 worker 组成同一个消费组，broker 为每个成员分配互不重叠的分区。
//! 每条消息处理完毕后才确认位点；处理中途停机的消息不确认，由 broker 重新投递。
//!
//! ## 停机流程
//!
//! 1. 广播停机信号，打断拉取等待和退避等待
//! 2. 在宽限期内等待所有 worker 自行退出
//! 3. 宽限期结束仍未退出的 worker 被强制中止

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use notify_shared::broker::{ConsumerFactory, MessageConsumer};
use notify_shared::config::WorkerConfig;
use notify_shared::retry::sleep_or_shutdown;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{NotificationError, Result};
use crate::health::HealthStatus;
use crate::metrics::{ConsumerMetrics, MetricsSnapshot};

/// 运行中的工作池
struct PoolState {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct NotificationConsumer {
    factory: Arc<dyn ConsumerFactory>,
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    state: Mutex<Option<PoolState>>,
}

impl NotificationConsumer {
    pub fn new(
        factory: Arc<dyn ConsumerFactory>,
        dispatcher: Arc<Dispatcher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            factory,
            dispatcher,
            config,
            state: Mutex::new(None),
        }
    }

    /// 创建消费组成员并启动 worker
    ///
    /// 任一成员创建失败时不启动任何 worker。
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(NotificationError::AlreadyRunning);
        }

        let worker_count = self.config.worker_count.max(1);
        let consumers = (0..worker_count)
            .map(|index| self.factory.create(index))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = consumers
            .into_iter()
            .enumerate()
            .map(|(index, consumer)| {
                let worker = Worker {
                    index,
                    consumer,
                    dispatcher: self.dispatcher.clone(),
                    poll_timeout: self.config.poll_timeout(),
                    poll_error_backoff: self.config.poll_error_backoff(),
                };
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();

        *state = Some(PoolState {
            shutdown_tx,
            handles,
        });
        info!(worker_count, "通知消费者工作池已启动");
        Ok(())
    }

    /// 停止工作池，未运行时直接返回
    pub async fn stop(&self) {
        let Some(pool) = self.state.lock().take() else {
            return;
        };

        let _ = pool.shutdown_tx.send(true);
        let grace = self.config.shutdown_grace();
        let aborts: Vec<_> = pool.handles.iter().map(JoinHandle::abort_handle).collect();

        match tokio::time::timeout(grace, join_all(pool.handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result
                        && e.is_panic()
                    {
                        error!(error = %e, "worker 异常退出");
                    }
                }
                info!("通知消费者工作池已停止");
            }
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "宽限期内仍有 worker 未退出，强制中止"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        self.metrics().reset_active_workers();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    /// 工作池在运行且没有 worker 提前退出
    pub fn health_check(&self) -> HealthStatus {
        let state = self.state.lock();
        let Some(pool) = state.as_ref() else {
            return HealthStatus::unhealthy("消费者未启动");
        };

        let exited = pool.handles.iter().filter(|h| h.is_finished()).count();
        if exited > 0 {
            return HealthStatus::unhealthy(format!(
                "{exited}/{} 个 worker 已退出",
                pool.handles.len()
            ));
        }
        HealthStatus::Healthy
    }

    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        self.dispatcher.metrics()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics().snapshot()
    }
}

/// 单个 worker：持有一个消费组成员会话
struct Worker {
    index: usize,
    consumer: Box<dyn MessageConsumer>,
    dispatcher: Arc<Dispatcher>,
    poll_timeout: Duration,
    poll_error_backoff: Duration,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let metrics = self.dispatcher.metrics().clone();
        metrics.worker_started();
        info!(worker = self.index, "worker 已启动");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                polled = self.consumer.poll(self.poll_timeout) => polled,
            };

            match polled {
                Ok(Some(msg)) => {
                    let outcome = self.dispatcher.process(&msg, &mut shutdown).await;
                    if !outcome.should_ack() {
                        debug!(
                            worker = self.index,
                            partition = msg.partition,
                            offset = msg.offset,
                            "消息未确认，等待重新投递"
                        );
                        break;
                    }
                    if let Err(e) = self.consumer.ack(&msg) {
                        metrics.record_broker_error();
                        warn!(
                            worker = self.index,
                            partition = msg.partition,
                            offset = msg.offset,
                            error = %e,
                            "确认位点失败"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    metrics.record_broker_error();
                    error!(
                        worker = self.index,
                        error = %e,
                        backoff_ms = self.poll_error_backoff.as_millis() as u64,
                        "拉取消息失败，暂停后重试"
                    );
                    if !sleep_or_shutdown(self.poll_error_backoff, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.consumer.close().await {
            warn!(worker = self.index, error = %e, "关闭消费者失败");
        }
        metrics.worker_stopped();
        info!(worker = self.index, "worker 已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use notify_shared::broker::{ConsumerMessage, MessageProducer};
    use notify_shared::error::InfraError;
    use notify_shared::memory::MemoryBroker;

    use crate::builder::NotificationBuilder;
    use crate::envelope::{Channel, NotificationStatus, NotificationType};
    use crate::handler::{ChannelReceipt, HandlerRegistry, MockChannelHandler};
    use crate::publisher::NotificationPublisher;

    const TOPIC: &str = "ticketing.notifications";
    const GROUP: &str = "notification-service";

    fn worker_config(worker_count: usize) -> WorkerConfig {
        WorkerConfig {
            worker_count,
            base_delay_ms: 10,
            poll_timeout_ms: 20,
            poll_error_backoff_ms: 50,
            shutdown_grace_ms: 500,
            ..Default::default()
        }
    }

    fn counting_email(calls: Arc<AtomicU32>) -> HandlerRegistry {
        let mut mock = MockChannelHandler::new();
        mock.expect_channel().return_const(Channel::Email);
        mock.expect_handle().returning(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChannelReceipt::new("msg"))
        });
        let registry = HandlerRegistry::new();
        registry.register(Channel::Email, Arc::new(mock)).unwrap();
        registry
    }

    fn pool(
        broker: &MemoryBroker,
        registry: HandlerRegistry,
        workers: usize,
    ) -> NotificationConsumer {
        let config = worker_config(workers);
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            &config,
            Arc::new(ConsumerMetrics::new()),
        );
        NotificationConsumer::new(
            Arc::new(broker.consumer_factory(GROUP, TOPIC)),
            Arc::new(dispatcher),
            config,
        )
    }

    async fn publish(broker: &MemoryBroker, user: &str) {
        let publisher = NotificationPublisher::new(Arc::new(broker.clone()), &Default::default());
        let mut env = NotificationBuilder::new()
            .notification_type(NotificationType::BookingConfirmed)
            .recipient(user, format!("{user}@example.com"))
            .build()
            .unwrap();
        publisher.publish(&mut env).await.unwrap();
        assert_eq!(env.status, NotificationStatus::Queued);
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("等待条件超时");
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let broker = MemoryBroker::new(2);
        let consumer = pool(&broker, HandlerRegistry::new(), 2);

        consumer.start().unwrap();
        assert!(consumer.is_running());
        assert!(matches!(consumer.start(), Err(NotificationError::AlreadyRunning)));

        consumer.stop().await;
        assert!(!consumer.is_running());
        // 停止后可以再次启动
        consumer.start().unwrap();
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_workers_process_and_ack() {
        let broker = MemoryBroker::new(4);
        let calls = Arc::new(AtomicU32::new(0));
        let consumer = pool(&broker, counting_email(calls.clone()), 3);

        for user in ["user-1", "user-2", "user-3", "user-4", "user-5"] {
            publish(&broker, user).await;
        }
        consumer.start().unwrap();

        wait_for(|| consumer.snapshot().processed == 5).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(consumer.snapshot().succeeded, 5);
        assert_eq!(consumer.snapshot().active_workers, 3);
        assert!(consumer.health_check().is_healthy());

        consumer.stop().await;
        assert_eq!(consumer.snapshot().active_workers, 0);
        assert!(!consumer.health_check().is_healthy());

        // 全部位点已提交
        let committed: i64 = (0..4)
            .filter_map(|p| broker.committed_offset(GROUP, TOPIC, p))
            .sum();
        assert_eq!(committed, 5);
    }

    /// 拉取总是失败的消费者
    struct BrokenConsumer;

    #[async_trait]
    impl MessageConsumer for BrokenConsumer {
        async fn poll(&self, _timeout: Duration) -> notify_shared::Result<Option<ConsumerMessage>> {
            Err(InfraError::Kafka("broker 不可达".to_string()))
        }

        fn ack(&self, _message: &ConsumerMessage) -> notify_shared::Result<()> {
            Ok(())
        }

        async fn close(&self) -> notify_shared::Result<()> {
            Ok(())
        }
    }

    struct BrokenFactory;

    impl ConsumerFactory for BrokenFactory {
        fn create(&self, _member_index: usize) -> notify_shared::Result<Box<dyn MessageConsumer>> {
            Ok(Box::new(BrokenConsumer))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_are_counted_and_paused() {
        let config = worker_config(1);
        let dispatcher = Dispatcher::new(
            Arc::new(HandlerRegistry::new()),
            &config,
            Arc::new(ConsumerMetrics::new()),
        );
        let consumer =
            NotificationConsumer::new(Arc::new(BrokenFactory), Arc::new(dispatcher), config);
        consumer.start().unwrap();

        // 每次失败后暂停 50ms
        tokio::time::sleep(Duration::from_millis(120)).await;
        let errors = consumer.snapshot().broker_errors;
        assert!((2..=3).contains(&errors), "broker_errors = {errors}");
        assert!(consumer.health_check().is_healthy());

        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let broker = MemoryBroker::new(1);
        let consumer = pool(&broker, HandlerRegistry::new(), 1);
        consumer.stop().await;
        assert!(!consumer.is_running());
    }

    #[tokio::test]
    async fn test_messages_published_after_start_are_consumed() {
        // 生产端与消费端共享同一个 broker 句柄
        let broker = MemoryBroker::new(1);
        let producer: Arc<dyn MessageProducer> = Arc::new(broker.clone());
        producer.flush(Duration::from_millis(10)).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let consumer = pool(&broker, counting_email(calls.clone()), 1);
        consumer.start().unwrap();
        publish(&broker, "user-9").await;

        wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
        consumer.stop().await;
    }
}
