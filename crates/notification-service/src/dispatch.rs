//! 单条消息的投递流程
//!
//! 解码、过期检查、按渠道并行投递并在渠道内重试，最后汇总状态。
//! 重试只发生在本次消费内，不会把消息重新写回 broker。
//! 唯一的例外是计划时间尚远的消息：worker 最多停留 `schedule_hold`，
//! 之后把信封写回 topic 末尾并确认，分区上其后的消息不被阻塞。
//! 返回的 [`MessageOutcome`] 决定 worker 是否确认位点。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use notify_shared::broker::ConsumerMessage;
use notify_shared::config::WorkerConfig;
use notify_shared::dlq::{DeadLetterMessage, DlqProducer};
use notify_shared::observability::metrics as prom;
use notify_shared::retry::{RetryPolicy, sleep_or_shutdown};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::envelope::{Channel, DeliveryAttempt, NotificationEnvelope, NotificationStatus};
use crate::error::NotificationError;
use crate::handler::{ChannelHandler, HandlerRegistry};
use crate::metrics::ConsumerMetrics;
use crate::publisher::NotificationPublisher;

/// 一条消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// 所有有处理器的渠道均投递成功
    Sent,
    /// 部分渠道成功
    PartiallyDelivered,
    /// 所有有处理器的渠道均失败
    Failed,
    /// 无事可做：没有可用处理器，或信封状态表明已处理过
    Skipped,
    /// 已过期，直接丢弃
    Expired,
    /// 重试预算耗尽的失败信封再次到达，标记为 EXPIRED
    Exhausted,
    /// 无法解码
    Malformed,
    /// 未到计划时间，已写回 topic 等待下一轮消费
    Deferred,
    /// 处理被停机信号打断，消息不确认，等待重新投递
    Interrupted,
}

impl MessageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::PartiallyDelivered => "partially_delivered",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Expired => "expired",
            Self::Exhausted => "exhausted",
            Self::Malformed => "malformed",
            Self::Deferred => "deferred",
            Self::Interrupted => "interrupted",
        }
    }

    /// 除被打断的消息外都确认位点
    pub fn should_ack(&self) -> bool {
        !matches!(self, Self::Interrupted)
    }

    /// 是否需要进入死信队列
    pub fn is_dead_letter(&self) -> bool {
        matches!(self, Self::Failed | Self::PartiallyDelivered)
    }
}

/// 单个渠道的投递结果
#[derive(Debug)]
struct ChannelReport {
    channel: Channel,
    attempts: Vec<DeliveryAttempt>,
    delivered: bool,
    retries_used: u32,
    last_error: Option<String>,
    interrupted: bool,
}

impl ChannelReport {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            attempts: Vec::new(),
            delivered: false,
            retries_used: 0,
            last_error: None,
            interrupted: false,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    processing_timeout: Duration,
    schedule_hold: Duration,
    dead_letter: Option<Arc<DlqProducer>>,
    requeue: Option<Arc<NotificationPublisher>>,
    metrics: Arc<ConsumerMetrics>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        config: &WorkerConfig,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        Self {
            registry,
            retry: RetryPolicy::from_config(config),
            processing_timeout: config.processing_timeout(),
            schedule_hold: config.schedule_hold(),
            dead_letter: None,
            requeue: None,
            metrics,
        }
    }

    /// 失败和部分成功的信封写入死信 topic
    pub fn with_dead_letter(mut self, producer: Arc<DlqProducer>) -> Self {
        self.dead_letter = Some(producer);
        self
    }

    /// 计划时间尚远的信封经由发布端写回 topic
    ///
    /// 未设置时 worker 一直持有消息到计划时间。
    pub fn with_requeue(mut self, publisher: Arc<NotificationPublisher>) -> Self {
        self.requeue = Some(publisher);
        self
    }

    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        &self.metrics
    }

    /// 处理一条 broker 消息，记录指标并返回结果
    pub async fn process(
        &self,
        msg: &ConsumerMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> MessageOutcome {
        let started = Instant::now();

        let outcome = match NotificationEnvelope::decode(&msg.payload) {
            Ok(mut envelope) => {
                let mut outcome = self.deliver(&mut envelope, shutdown).await;
                if outcome == MessageOutcome::Deferred {
                    outcome = self.requeue(&mut envelope, shutdown).await;
                }
                if outcome.is_dead_letter() {
                    self.send_dead_letter(msg, &envelope).await;
                }
                outcome
            }
            Err(e) => {
                // 毒消息直接确认，避免反复消费
                error!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %e,
                    "通知消息解码失败，跳过"
                );
                MessageOutcome::Malformed
            }
        };

        self.metrics.record(&outcome, started.elapsed());
        outcome
    }

    /// 对已解码的信封执行投递，原地更新状态与投递记录
    ///
    /// 配置了写回时，计划时间在 `schedule_hold` 之后的信封返回
    /// [`MessageOutcome::Deferred`]，由调用方负责写回。
    pub async fn deliver(
        &self,
        envelope: &mut NotificationEnvelope,
        shutdown: &mut watch::Receiver<bool>,
    ) -> MessageOutcome {
        let hold = self.requeue.as_ref().map(|_| self.schedule_hold);
        self.deliver_with_hold(envelope, shutdown, hold).await
    }

    async fn deliver_with_hold(
        &self,
        envelope: &mut NotificationEnvelope,
        shutdown: &mut watch::Receiver<bool>,
        hold: Option<Duration>,
    ) -> MessageOutcome {
        if envelope.is_expired() {
            debug!(notification_id = %envelope.id, "通知已过期，丢弃");
            return MessageOutcome::Expired;
        }

        match envelope.status {
            NotificationStatus::Queued => {}
            NotificationStatus::Pending => {
                if let Err(e) = envelope.transition(NotificationStatus::Queued) {
                    warn!(notification_id = %envelope.id, error = %e, "通知状态异常，跳过");
                    return MessageOutcome::Skipped;
                }
            }
            NotificationStatus::Failed if envelope.retries_exhausted() => {
                return match envelope.transition(NotificationStatus::Expired) {
                    Ok(()) => {
                        info!(
                            notification_id = %envelope.id,
                            retry_count = envelope.retry_count,
                            "重试预算已耗尽，通知标记为过期"
                        );
                        MessageOutcome::Exhausted
                    }
                    Err(e) => {
                        warn!(notification_id = %envelope.id, error = %e, "通知状态异常，跳过");
                        MessageOutcome::Skipped
                    }
                };
            }
            status => {
                debug!(
                    notification_id = %envelope.id,
                    status = %status,
                    "通知已处理过，跳过"
                );
                return MessageOutcome::Skipped;
            }
        }

        if let Some(at) = envelope.scheduled_for
            && envelope.is_scheduled_after(Utc::now())
        {
            let remaining = (at - Utc::now()).to_std().unwrap_or_default();
            let wait = hold.map_or(remaining, |hold| remaining.min(hold));
            debug!(
                notification_id = %envelope.id,
                wait_ms = wait.as_millis() as u64,
                remaining_ms = remaining.as_millis() as u64,
                "等待计划发送时间"
            );
            if !sleep_or_shutdown(wait, shutdown).await {
                return MessageOutcome::Interrupted;
            }
            if envelope.is_scheduled_after(Utc::now()) {
                return MessageOutcome::Deferred;
            }
            if envelope.is_expired() {
                debug!(notification_id = %envelope.id, "等待期间通知已过期，丢弃");
                return MessageOutcome::Expired;
            }
        }

        if let Err(e) = envelope.transition(NotificationStatus::Sending) {
            warn!(notification_id = %envelope.id, error = %e, "通知状态异常，跳过");
            return MessageOutcome::Skipped;
        }

        let reports = self.dispatch_channels(envelope, shutdown).await;
        if reports.iter().any(|r| r.interrupted) {
            info!(notification_id = %envelope.id, "投递被停机打断，等待重新消费");
            return MessageOutcome::Interrupted;
        }

        self.aggregate(envelope, reports)
    }

    /// 各渠道并行投递，每个渠道持有独立的停机信号副本
    async fn dispatch_channels(
        &self,
        envelope: &NotificationEnvelope,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<ChannelReport> {
        let policy = self.retry.with_max_retries(envelope.max_retries);

        let deliveries = envelope.channels.iter().filter_map(|&channel| {
            let Some(handler) = self.registry.get(channel) else {
                debug!(
                    notification_id = %envelope.id,
                    channel = %channel,
                    "渠道未注册处理器，跳过"
                );
                return None;
            };
            let shutdown = shutdown.clone();
            Some(self.deliver_channel(channel, handler, envelope, policy, shutdown))
        });

        join_all(deliveries).await
    }

    async fn deliver_channel(
        &self,
        channel: Channel,
        handler: Arc<dyn ChannelHandler>,
        envelope: &NotificationEnvelope,
        policy: RetryPolicy,
        mut shutdown: watch::Receiver<bool>,
    ) -> ChannelReport {
        let mut report = ChannelReport::new(channel);

        for attempt in 0..policy.max_attempts() {
            if attempt > 0 {
                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    notification_id = %envelope.id,
                    channel = %channel,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "等待后重试"
                );
                if !sleep_or_shutdown(delay, &mut shutdown).await {
                    report.interrupted = true;
                    return report;
                }
                report.retries_used = attempt;
            }

            let call = tokio::time::timeout(self.processing_timeout, handler.handle(envelope));
            let result = match call.await {
                Ok(result) => result,
                Err(_) => Err(NotificationError::Timeout {
                    channel,
                    timeout_ms: self.processing_timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(receipt) => {
                    prom::record_delivery_attempt(channel.as_str(), "delivered");
                    report
                        .attempts
                        .push(DeliveryAttempt::delivered(channel, receipt.message_id));
                    report.delivered = true;
                    return report;
                }
                Err(e) => {
                    prom::record_delivery_attempt(channel.as_str(), "failed");
                    let retryable = e.is_retryable();
                    warn!(
                        notification_id = %envelope.id,
                        channel = %channel,
                        attempt,
                        retryable,
                        error = %e,
                        "渠道投递失败"
                    );
                    let reason = e.to_string();
                    report.attempts.push(DeliveryAttempt::failed(channel, &reason));
                    report.last_error = Some(reason);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        report
    }

    /// 汇总各渠道结果并推进信封终态
    fn aggregate(
        &self,
        envelope: &mut NotificationEnvelope,
        reports: Vec<ChannelReport>,
    ) -> MessageOutcome {
        let handled = reports.len();
        let succeeded = reports.iter().filter(|r| r.delivered).count();
        let mut last_error = None;

        for report in reports {
            debug!(
                notification_id = %envelope.id,
                channel = %report.channel,
                delivered = report.delivered,
                attempts = report.attempts.len(),
                "渠道投递结束"
            );
            envelope.retry_count = envelope.retry_count.max(report.retries_used);
            if !report.delivered {
                last_error = report.last_error.or(last_error);
            }
            for attempt in report.attempts {
                envelope.record_attempt(attempt);
            }
        }

        let (next, outcome) = if handled == 0 {
            (NotificationStatus::Sent, MessageOutcome::Skipped)
        } else if succeeded == handled {
            (NotificationStatus::Sent, MessageOutcome::Sent)
        } else if succeeded == 0 {
            (NotificationStatus::Failed, MessageOutcome::Failed)
        } else {
            (
                NotificationStatus::PartiallyDelivered,
                MessageOutcome::PartiallyDelivered,
            )
        };

        if next != NotificationStatus::Sent {
            envelope.last_error = last_error;
        }
        if let Err(e) = envelope.transition(next) {
            // SENDING 到上述三种状态都是合法流转
            error!(notification_id = %envelope.id, error = %e, "通知状态流转失败");
        }

        info!(
            notification_id = %envelope.id,
            notification_type = %envelope.notification_type,
            user_id = %envelope.user_id,
            status = %envelope.status,
            handled_channels = handled,
            succeeded_channels = succeeded,
            retry_count = envelope.retry_count,
            "通知处理完成"
        );
        outcome
    }

    /// 把未到期的信封写回 topic 末尾；写回失败时退回到持有消息直到计划时间
    async fn requeue(
        &self,
        envelope: &mut NotificationEnvelope,
        shutdown: &mut watch::Receiver<bool>,
    ) -> MessageOutcome {
        let Some(publisher) = &self.requeue else {
            return self.deliver_with_hold(envelope, shutdown, None).await;
        };

        match publisher.requeue(envelope).await {
            Ok(receipt) => {
                debug!(
                    notification_id = %envelope.id,
                    partition = receipt.partition,
                    offset = receipt.offset,
                    "未到计划时间，通知已写回 topic"
                );
                MessageOutcome::Deferred
            }
            Err(e) => {
                self.metrics.record_broker_error();
                warn!(
                    notification_id = %envelope.id,
                    error = %e,
                    "通知写回失败，改为等待到计划时间"
                );
                self.deliver_with_hold(envelope, shutdown, None).await
            }
        }
    }

    async fn send_dead_letter(&self, msg: &ConsumerMessage, envelope: &NotificationEnvelope) {
        let Some(dead_letter) = &self.dead_letter else {
            return;
        };

        let payload = match envelope.encode() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                error!(notification_id = %envelope.id, error = %e, "序列化死信失败");
                return;
            }
        };
        let message = DeadLetterMessage::new(
            &envelope.id,
            envelope.partition_key(),
            &msg.topic,
            payload,
            envelope.last_error.clone().unwrap_or_default(),
            envelope.retry_count,
            envelope.max_retries,
            dead_letter.source_service(),
        );

        if let Err(e) = dead_letter.send(&message).await {
            error!(
                notification_id = %envelope.id,
                error = %e,
                "发送到死信队列失败"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::builder::NotificationBuilder;
    use crate::envelope::{AttemptOutcome, NotificationType};
    use crate::handler::{ChannelReceipt, MockChannelHandler, SmsHandler};
    use notify_shared::broker::MessageProducer;
    use notify_shared::memory::MemoryBroker;

    const TOPIC: &str = "ticketing.notifications";
    const DLQ_TOPIC: &str = "ticketing.notifications.dlq";

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            base_delay_ms: 100,
            processing_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    fn transport_error() -> NotificationError {
        NotificationError::Transport {
            channel: Channel::Email,
            reason: "connection refused".to_string(),
        }
    }

    /// 前 `failures` 次调用失败，之后成功
    fn flaky_email(failures: u32, calls: Arc<AtomicU32>) -> MockChannelHandler {
        let mut mock = MockChannelHandler::new();
        mock.expect_channel().return_const(Channel::Email);
        mock.expect_handle().returning(move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                Err(transport_error())
            } else {
                Ok(ChannelReceipt::new(format!("msg-{n}")))
            }
        });
        mock
    }

    fn dispatcher(registry: HandlerRegistry) -> Dispatcher {
        Dispatcher::new(
            Arc::new(registry),
            &worker_config(),
            Arc::new(ConsumerMetrics::new()),
        )
    }

    fn email_only(handler: MockChannelHandler) -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry.register(Channel::Email, Arc::new(handler)).unwrap();
        registry
    }

    fn queued(channels: Vec<Channel>) -> NotificationEnvelope {
        let mut env = NotificationBuilder::new()
            .notification_type(NotificationType::BookingConfirmed)
            .recipient("user-1", "user-1@example.com")
            .channels(channels)
            .max_retries(3)
            .build()
            .unwrap();
        env.transition(NotificationStatus::Queued).unwrap();
        env
    }

    fn message(env: &NotificationEnvelope) -> ConsumerMessage {
        ConsumerMessage {
            topic: TOPIC.to_string(),
            partition: 0,
            offset: 0,
            key: Some(env.user_id.clone()),
            payload: env.encode().unwrap(),
            timestamp: None,
            headers: Default::default(),
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = dispatcher(email_only(flaky_email(2, calls.clone())));
        let mut env = queued(vec![Channel::Email]);

        let outcome = dispatcher.deliver(&mut env, &mut no_shutdown()).await;

        assert_eq!(outcome, MessageOutcome::Sent);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let outcomes: Vec<_> = env.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::Failed,
                AttemptOutcome::Failed,
                AttemptOutcome::Delivered
            ]
        );
        assert_eq!(env.status, NotificationStatus::Sent);
        assert!(env.sent_at.is_some());
        assert_eq!(env.retry_count, 2);
        assert_eq!(env.attempts[2].message_id.as_deref(), Some("msg-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_envelope_is_dropped_without_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = dispatcher(email_only(flaky_email(0, calls.clone())));
        let mut env = queued(vec![Channel::Email]);
        env.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        let before = env.clone();

        let outcome = dispatcher.process(&message(&env), &mut no_shutdown()).await;
        assert_eq!(outcome, MessageOutcome::Expired);
        assert!(outcome.should_ack());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // 信封本身不被修改
        let mut local = before.clone();
        assert_eq!(
            dispatcher.deliver(&mut local, &mut no_shutdown()).await,
            MessageOutcome::Expired
        );
        assert_eq!(local, before);
        assert_eq!(dispatcher.metrics().snapshot().expired, 1);
        assert_eq!(dispatcher.metrics().snapshot().failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = dispatcher(email_only(flaky_email(u32::MAX, calls.clone())));
        let mut env = queued(vec![Channel::Email]);

        let outcome = dispatcher.deliver(&mut env, &mut no_shutdown()).await;

        assert_eq!(outcome, MessageOutcome::Failed);
        assert_eq!(env.attempts_for(Channel::Email).count(), 4);
        assert!(env.attempts.iter().all(|a| !a.is_delivered()));
        assert_eq!(env.status, NotificationStatus::Failed);
        assert_eq!(env.retry_count, env.max_retries);
        assert!(env.last_error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_attempts() {
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorded = stamps.clone();
        let mut mock = MockChannelHandler::new();
        mock.expect_channel().return_const(Channel::Email);
        mock.expect_handle().returning(move |_| {
            recorded.lock().push(tokio::time::Instant::now());
            Err(transport_error())
        });

        let dispatcher = dispatcher(email_only(mock));
        let mut env = queued(vec![Channel::Email]);
        dispatcher.deliver(&mut env, &mut no_shutdown()).await;

        let stamps = stamps.lock();
        let gaps: Vec<u128> = stamps.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        assert_eq!(gaps, vec![100, 200, 400]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_handler_is_not_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = dispatcher(email_only(flaky_email(0, calls.clone())));
        let mut env = queued(vec![Channel::Email, Channel::Push]);

        let outcome = dispatcher.deliver(&mut env, &mut no_shutdown()).await;

        assert_eq!(outcome, MessageOutcome::Sent);
        assert_eq!(env.attempts.len(), 1);
        assert_eq!(env.attempts_for(Channel::Push).count(), 0);
        assert_eq!(env.status, NotificationStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_registered_handler_is_skipped() {
        let dispatcher = dispatcher(HandlerRegistry::new());
        let mut env = queued(vec![Channel::Push]);

        let outcome = dispatcher.deliver(&mut env, &mut no_shutdown()).await;
        assert_eq!(outcome, MessageOutcome::Skipped);
        assert!(env.attempts.is_empty());
        assert_eq!(env.status, NotificationStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let mut mock = MockChannelHandler::new();
        mock.expect_channel().return_const(Channel::Email);
        mock.expect_handle()
            .times(1)
            .returning(|_| Err(NotificationError::Render("missing variable".to_string())));

        let dispatcher = dispatcher(email_only(mock));
        let mut env = queued(vec![Channel::Email]);

        let outcome = dispatcher.deliver(&mut env, &mut no_shutdown()).await;
        assert_eq!(outcome, MessageOutcome::Failed);
        assert_eq!(env.attempts.len(), 1);
        assert_eq!(env.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_delivery() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = email_only(flaky_email(0, calls.clone()));
        registry.register(Channel::Sms, Arc::new(SmsHandler)).unwrap();
        let dispatcher = dispatcher(registry);
        // 没有手机号，短信渠道直接失败
        let mut env = queued(vec![Channel::Email, Channel::Sms]);

        let outcome = dispatcher.deliver(&mut env, &mut no_shutdown()).await;
        assert_eq!(outcome, MessageOutcome::PartiallyDelivered);
        assert_eq!(env.status, NotificationStatus::PartiallyDelivered);
        assert!(env.attempts_for(Channel::Email).all(|a| a.is_delivered()));
        assert_eq!(env.attempts_for(Channel::Sms).count(), 1);
        assert!(env.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_is_retried() {
        let mut mock = MockChannelHandler::new();
        mock.expect_channel().return_const(Channel::Email);
        mock.expect_handle().returning(|_| Err(NotificationError::Timeout {
            channel: Channel::Email,
            timeout_ms: 1_000,
        }));

        let dispatcher = dispatcher(email_only(mock));
        let mut env = queued(vec![Channel::Email]);
        env.max_retries = 1;

        let outcome = dispatcher.deliver(&mut env, &mut no_shutdown()).await;
        assert_eq!(outcome, MessageOutcome::Failed);
        assert_eq!(env.attempts.len(), 2);
        assert!(env.last_error.as_deref().unwrap().contains("超时"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = dispatcher(email_only(flaky_email(u32::MAX, calls.clone())));
        let env = queued(vec![Channel::Email]);
        let msg = message(&env);

        let (tx, mut rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = tx.send(true);
        });

        let outcome = dispatcher.process(&msg, &mut rx).await;
        stopper.await.unwrap();

        assert_eq!(outcome, MessageOutcome::Interrupted);
        assert!(!outcome.should_ack());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.metrics().snapshot().processed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_failed_envelope_expires() {
        let dispatcher = dispatcher(HandlerRegistry::new());
        let mut env = queued(vec![Channel::Email]);
        env.mark_failed("earlier").unwrap();
        env.retry_count = env.max_retries;

        let outcome = dispatcher.deliver(&mut env, &mut no_shutdown()).await;
        assert_eq!(outcome, MessageOutcome::Exhausted);
        assert_eq!(env.status, NotificationStatus::Expired);
        assert!(env.attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_sent_is_skipped() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = dispatcher(email_only(flaky_email(0, calls.clone())));
        let mut env = queued(vec![Channel::Email]);
        env.transition(NotificationStatus::Sending).unwrap();
        env.transition(NotificationStatus::Sent).unwrap();

        let outcome = dispatcher.deliver(&mut env, &mut no_shutdown()).await;
        assert_eq!(outcome, MessageOutcome::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_envelope_waits_until_due() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = dispatcher(email_only(flaky_email(0, calls.clone())));
        let mut env = queued(vec![Channel::Email]);
        env.scheduled_for = Some(Utc::now() + chrono::Duration::seconds(30));

        let (tx, mut rx) = watch::channel(false);
        let _ = tx.send(true);
        let outcome = dispatcher.deliver(&mut env, &mut rx).await;
        assert_eq!(outcome, MessageOutcome::Interrupted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(env.status, NotificationStatus::Queued);
    }

    /// 带写回能力的分发器，计划时间超过 10ms 的信封会被写回
    fn requeueing(registry: HandlerRegistry, broker: &MemoryBroker) -> Dispatcher {
        let config = WorkerConfig {
            schedule_hold_ms: 10,
            ..worker_config()
        };
        let publisher = NotificationPublisher::new(
            Arc::new(broker.clone()),
            &notify_shared::config::KafkaConfig::default(),
        );
        Dispatcher::new(Arc::new(registry), &config, Arc::new(ConsumerMetrics::new()))
            .with_requeue(Arc::new(publisher))
    }

    #[tokio::test]
    async fn test_far_scheduled_envelope_is_requeued() {
        let broker = MemoryBroker::new(1);
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = requeueing(email_only(flaky_email(0, calls.clone())), &broker);
        let mut env = queued(vec![Channel::Email]);
        env.scheduled_for = Some(Utc::now() + chrono::Duration::hours(1));

        let outcome = dispatcher.process(&message(&env), &mut no_shutdown()).await;
        assert_eq!(outcome, MessageOutcome::Deferred);
        assert!(outcome.should_ack());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // 写回的是原样的 QUEUED 信封
        let stored = broker.messages(TOPIC);
        assert_eq!(stored.len(), 1);
        assert_eq!(NotificationEnvelope::decode(&stored[0].payload).unwrap(), env);
        assert_eq!(dispatcher.metrics().snapshot().deferred, 1);
    }

    #[tokio::test]
    async fn test_scheduled_within_hold_is_delivered() {
        let broker = MemoryBroker::new(1);
        let calls = Arc::new(AtomicU32::new(0));
        let config = WorkerConfig {
            schedule_hold_ms: 1_000,
            ..worker_config()
        };
        let publisher = NotificationPublisher::new(
            Arc::new(broker.clone()),
            &notify_shared::config::KafkaConfig::default(),
        );
        let dispatcher = Dispatcher::new(
            Arc::new(email_only(flaky_email(0, calls.clone()))),
            &config,
            Arc::new(ConsumerMetrics::new()),
        )
        .with_requeue(Arc::new(publisher));
        let mut env = queued(vec![Channel::Email]);
        env.scheduled_for = Some(Utc::now() + chrono::Duration::milliseconds(50));

        let outcome = dispatcher.process(&message(&env), &mut no_shutdown()).await;
        assert_eq!(outcome, MessageOutcome::Sent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.message_count(TOPIC), 0);
    }

    #[tokio::test]
    async fn test_requeue_failure_falls_back_to_waiting() {
        let broker = MemoryBroker::new(1);
        broker.fail_next_sends(1);
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = requeueing(email_only(flaky_email(0, calls.clone())), &broker);
        let mut env = queued(vec![Channel::Email]);
        env.scheduled_for = Some(Utc::now() + chrono::Duration::milliseconds(200));

        let outcome = dispatcher.process(&message(&env), &mut no_shutdown()).await;
        assert_eq!(outcome, MessageOutcome::Sent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.message_count(TOPIC), 0);
        assert_eq!(dispatcher.metrics().snapshot().broker_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_is_acked() {
        let dispatcher = dispatcher(HandlerRegistry::new());
        let msg = ConsumerMessage {
            topic: TOPIC.to_string(),
            partition: 0,
            offset: 7,
            key: None,
            payload: b"not json".to_vec(),
            timestamp: None,
            headers: Default::default(),
        };

        let outcome = dispatcher.process(&msg, &mut no_shutdown()).await;
        assert_eq!(outcome, MessageOutcome::Malformed);
        assert!(outcome.should_ack());
        assert_eq!(dispatcher.metrics().snapshot().malformed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_envelope_goes_to_dead_letter() {
        let broker = MemoryBroker::new(1);
        let producer: Arc<dyn MessageProducer> = Arc::new(broker.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = dispatcher(email_only(flaky_email(u32::MAX, calls)))
            .with_dead_letter(Arc::new(DlqProducer::new(
                producer,
                DLQ_TOPIC,
                "notification-service",
            )));
        let env = queued(vec![Channel::Email]);

        let outcome = dispatcher.process(&message(&env), &mut no_shutdown()).await;
        assert_eq!(outcome, MessageOutcome::Failed);

        let dead = broker.messages(DLQ_TOPIC);
        assert_eq!(dead.len(), 1);
        let letter: DeadLetterMessage = dead[0].deserialize_payload().unwrap();
        assert_eq!(letter.message_id, env.id);
        assert_eq!(letter.source_topic, TOPIC);
        assert!(letter.is_exhausted());

        // 回放后的信封被标记为过期，不再投递
        let mut replayed = NotificationEnvelope::decode(letter.payload.as_bytes()).unwrap();
        assert_eq!(replayed.status, NotificationStatus::Failed);
        assert_eq!(
            dispatcher.deliver(&mut replayed, &mut no_shutdown()).await,
            MessageOutcome::Exhausted
        );
    }
}
