//! 通知服务编排
//!
//! 组装发布端、处理器注册表和消费者工作池，对外提供启动、停止、健康检查
//! 以及常用通知的构建加发布入口。服务在 `main` 中显式构造后以 `Arc` 传递。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use notify_shared::broker::{ConsumerFactory, DeliveryReceipt, MessageProducer};
use notify_shared::config::AppConfig;
use notify_shared::dlq::DlqProducer;
use notify_shared::kafka::{KafkaConsumerFactory, KafkaProducer};
use tracing::{info, warn};

use crate::builder::{NotificationBuilder, Recipient};
use crate::consumer::NotificationConsumer;
use crate::dispatch::Dispatcher;
use crate::envelope::{Channel, NotificationEnvelope};
use crate::error::{NotificationError, Result};
use crate::handler::{
    ChannelHandler, EmailHandler, HandlerRegistry, MailTransport, PushHandler, SmsHandler,
};
use crate::health::HealthStatus;
use crate::metrics::{ConsumerMetrics, MetricsSnapshot};
use crate::publisher::{BatchReport, NotificationPublisher};
use crate::templates::TemplateEngine;

pub struct NotificationService {
    config: AppConfig,
    producer: Arc<dyn MessageProducer>,
    publisher: Arc<NotificationPublisher>,
    consumer: NotificationConsumer,
    registry: Arc<HandlerRegistry>,
    templates: Arc<TemplateEngine>,
    /// 替换默认的 SMTP 出口，未设置时按配置连接中继
    mail_transport: Option<Arc<dyn MailTransport>>,
}

impl NotificationService {
    pub fn new(
        config: AppConfig,
        producer: Arc<dyn MessageProducer>,
        consumer_factory: Arc<dyn ConsumerFactory>,
    ) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let metrics = Arc::new(ConsumerMetrics::new());

        let publisher = Arc::new(NotificationPublisher::new(producer.clone(), &config.kafka));
        let mut dispatcher = Dispatcher::new(registry.clone(), &config.worker, metrics)
            .with_requeue(publisher.clone());
        if let Some(topic) = config.kafka.dead_letter_topic() {
            dispatcher = dispatcher.with_dead_letter(Arc::new(DlqProducer::new(
                producer.clone(),
                topic,
                &config.service_name,
            )));
        }

        let consumer = NotificationConsumer::new(
            consumer_factory,
            Arc::new(dispatcher),
            config.worker.clone(),
        );

        Self {
            config,
            producer,
            publisher,
            consumer,
            registry,
            templates: Arc::new(TemplateEngine::new()),
            mail_transport: None,
        }
    }

    /// 按配置连接 Kafka
    pub fn with_kafka(config: AppConfig) -> Result<Self> {
        let producer = Arc::new(KafkaProducer::new(&config.kafka)?);
        let factory = Arc::new(KafkaConsumerFactory::new(config.kafka.clone()));
        Ok(Self::new(config, producer, factory))
    }

    pub fn with_mail_transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.mail_transport = Some(transport);
        self
    }

    pub fn templates(&self) -> &Arc<TemplateEngine> {
        &self.templates
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn publisher(&self) -> &NotificationPublisher {
        &self.publisher
    }

    /// 注册自定义处理器，启动时不会被默认处理器覆盖
    pub fn register_handler(
        &self,
        channel: Channel,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<()> {
        self.registry.register(channel, handler)
    }

    // ==================== 生命周期 ====================

    /// 注册启用的渠道处理器并启动工作池
    pub fn start(&self) -> Result<()> {
        if self.consumer.is_running() {
            return Err(NotificationError::AlreadyRunning);
        }

        self.register_default_handlers()?;
        self.consumer.start()?;

        info!(
            service = %self.config.service_name,
            topic = %self.publisher.topic(),
            channels = ?self.registry.registered_channels(),
            "通知服务已启动"
        );
        Ok(())
    }

    /// 停止工作池并刷新生产者
    pub async fn stop(&self) {
        self.consumer.stop().await;

        if let Err(e) = self.producer.flush(self.config.kafka.send_timeout()) {
            warn!(error = %e, "刷新生产者失败，部分通知可能未发出");
        }
        info!(service = %self.config.service_name, "通知服务已停止");
    }

    pub fn is_running(&self) -> bool {
        self.consumer.is_running()
    }

    fn register_default_handlers(&self) -> Result<()> {
        let channels = &self.config.channels;

        if channels.email_enabled && !self.registry.contains(Channel::Email) {
            let smtp = &self.config.smtp;
            let handler = match &self.mail_transport {
                Some(transport) => EmailHandler::new(
                    self.templates.clone(),
                    transport.clone(),
                    &smtp.from_name,
                    &smtp.from_address,
                )?,
                None => EmailHandler::from_config(self.templates.clone(), smtp)?,
            };
            self.registry.register(Channel::Email, Arc::new(handler))?;
        }
        if channels.sms_enabled && !self.registry.contains(Channel::Sms) {
            self.registry.register(Channel::Sms, Arc::new(SmsHandler))?;
        }
        if channels.push_enabled && !self.registry.contains(Channel::Push) {
            self.registry.register(Channel::Push, Arc::new(PushHandler))?;
        }

        if self.registry.is_empty() {
            warn!("没有启用任何渠道处理器，所有通知都将被跳过");
        }
        Ok(())
    }

    // ==================== 健康与指标 ====================

    pub fn health_check(&self) -> HealthStatus {
        if !self.is_running() {
            return HealthStatus::unhealthy("服务未运行");
        }
        if let HealthStatus::Unhealthy(reason) = self.publisher.health_check() {
            return HealthStatus::unhealthy(format!("发布端异常: {reason}"));
        }
        if let HealthStatus::Unhealthy(reason) = self.consumer.health_check() {
            return HealthStatus::unhealthy(format!("消费端异常: {reason}"));
        }
        if self.registry.is_empty() {
            return HealthStatus::unhealthy("没有注册任何渠道处理器");
        }
        HealthStatus::Healthy
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.consumer.snapshot()
    }

    // ==================== 发布 ====================

    pub async fn publish(&self, envelope: &mut NotificationEnvelope) -> Result<DeliveryReceipt> {
        self.publisher.publish(envelope).await
    }

    pub async fn publish_batch(
        &self,
        envelopes: &mut [NotificationEnvelope],
    ) -> Result<BatchReport> {
        self.publisher.publish_batch(envelopes).await
    }

    pub async fn publish_scheduled(
        &self,
        envelope: &mut NotificationEnvelope,
        at: DateTime<Utc>,
    ) -> Result<DeliveryReceipt> {
        self.publisher.publish_scheduled(envelope, at).await
    }

    /// 构建并发布，未指定重试上限时使用配置值
    pub async fn notify(&self, builder: NotificationBuilder) -> Result<NotificationEnvelope> {
        let mut envelope = builder
            .default_max_retries(self.config.worker.max_retries)
            .build()?;
        self.publisher.publish(&mut envelope).await?;
        Ok(envelope)
    }

    pub async fn notify_waitlist_spot_available(
        &self,
        recipient: Recipient,
        event_id: &str,
        waitlist_entry_id: &str,
        event_name: &str,
        claim_deadline: DateTime<Utc>,
    ) -> Result<NotificationEnvelope> {
        self.notify(NotificationBuilder::waitlist_spot_available(
            recipient,
            event_id,
            waitlist_entry_id,
            event_name,
            claim_deadline,
        ))
        .await
    }

    pub async fn notify_waitlist_position_update(
        &self,
        recipient: Recipient,
        event_id: &str,
        waitlist_entry_id: &str,
        event_name: &str,
        position: u32,
    ) -> Result<NotificationEnvelope> {
        self.notify(NotificationBuilder::waitlist_position_update(
            recipient,
            event_id,
            waitlist_entry_id,
            event_name,
            position,
        ))
        .await
    }

    pub async fn notify_booking_confirmed(
        &self,
        recipient: Recipient,
        event_id: &str,
        booking_id: &str,
        event_name: &str,
        ticket_count: u32,
    ) -> Result<NotificationEnvelope> {
        self.notify(NotificationBuilder::booking_confirmed(
            recipient,
            event_id,
            booking_id,
            event_name,
            ticket_count,
        ))
        .await
    }

    pub async fn notify_booking_cancelled(
        &self,
        recipient: Recipient,
        event_id: &str,
        booking_id: &str,
        event_name: &str,
        reason: &str,
    ) -> Result<NotificationEnvelope> {
        self.notify(NotificationBuilder::booking_cancelled(
            recipient, event_id, booking_id, event_name, reason,
        ))
        .await
    }

    pub async fn notify_event_reminder(
        &self,
        recipient: Recipient,
        event_id: &str,
        event_name: &str,
        starts_at: DateTime<Utc>,
    ) -> Result<NotificationEnvelope> {
        self.notify(NotificationBuilder::event_reminder(
            recipient, event_id, event_name, starts_at,
        ))
        .await
    }

    pub async fn notify_event_cancelled(
        &self,
        recipient: Recipient,
        event_id: &str,
        event_name: &str,
        reason: &str,
    ) -> Result<NotificationEnvelope> {
        self.notify(NotificationBuilder::event_cancelled(
            recipient, event_id, event_name, reason,
        ))
        .await
    }
}
