//! 通知发布
//!
//! 将信封序列化后追加到通知 topic，分区键为接收者 ID，保证同一接收者的通知有序。
//! 发送的是信封切换到 QUEUED 之后的副本，本地信封只在 broker 确认后才替换为该副本，
//! 因此消费端看到的内容与发布端记录的状态始终一致。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use notify_shared::broker::{DeliveryReceipt, MessageProducer, ProducerRecord};
use notify_shared::config::KafkaConfig;
use notify_shared::observability::metrics as prom;
use tracing::{debug, error, info, warn};

use crate::builder::NotificationBuilder;
use crate::envelope::{NotificationEnvelope, NotificationStatus, NotificationType};
use crate::error::{NotificationError, Result};
use crate::health::HealthStatus;

/// 消息体编码版本
pub const SCHEMA_VERSION: &str = "1";

/// 批量发布结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// 成功写入的通知 ID
    pub published: Vec<String>,
    /// 因状态不对或无法序列化而跳过的通知 ID
    pub skipped: Vec<String>,
    /// broker 拒绝写入、已标记为 FAILED 的通知 ID
    pub failed: Vec<String>,
}

pub struct NotificationPublisher {
    producer: Arc<dyn MessageProducer>,
    topic: String,
    producer_id: String,
    brokers: Vec<String>,
}

impl NotificationPublisher {
    pub fn new(producer: Arc<dyn MessageProducer>, config: &KafkaConfig) -> Self {
        Self {
            producer,
            topic: config.topic.clone(),
            producer_id: config.producer_id.clone(),
            brokers: config.broker_list(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 发布单条通知
    ///
    /// 只接受 PENDING 状态的信封。序列化失败时信封保持不变；
    /// broker 写入失败时信封标记为 FAILED 并记录原因。
    pub async fn publish(&self, envelope: &mut NotificationEnvelope) -> Result<DeliveryReceipt> {
        let (queued, record) = self.prepare(envelope)?;

        match self.producer.send(record).await {
            Ok(receipt) => {
                *envelope = queued;
                prom::record_publish(envelope.notification_type.as_str(), "success");
                info!(
                    notification_id = %envelope.id,
                    notification_type = %envelope.notification_type,
                    user_id = %envelope.user_id,
                    partition = receipt.partition,
                    offset = receipt.offset,
                    "通知已发布"
                );
                Ok(receipt)
            }
            Err(e) => {
                envelope.mark_failed(e.to_string())?;
                prom::record_publish(envelope.notification_type.as_str(), "failed");
                error!(
                    notification_id = %envelope.id,
                    error = %e,
                    "通知发布失败"
                );
                Err(e.into())
            }
        }
    }

    /// 批量发布
    ///
    /// 状态不对或无法序列化的信封被跳过并记录日志，不影响其余信封。
    /// 每条消息按 broker 的确认结果单独落状态：确认的变为 QUEUED，
    /// 被拒绝的标记为 FAILED。全部被拒绝时返回错误。
    pub async fn publish_batch(
        &self,
        envelopes: &mut [NotificationEnvelope],
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let mut staged: Vec<(usize, NotificationEnvelope)> = Vec::new();
        let mut records: Vec<ProducerRecord> = Vec::new();

        for (index, envelope) in envelopes.iter().enumerate() {
            match self.prepare(envelope) {
                Ok((queued, record)) => {
                    staged.push((index, queued));
                    records.push(record);
                }
                Err(e) => {
                    warn!(
                        notification_id = %envelope.id,
                        error = %e,
                        "跳过无法发布的通知"
                    );
                    report.skipped.push(envelope.id.clone());
                }
            }
        }

        if records.is_empty() {
            return Ok(report);
        }

        let results = self.producer.send_batch(records).await;
        let mut last_error = None;
        for ((index, queued), result) in staged.into_iter().zip(results) {
            match result {
                Ok(_) => {
                    prom::record_publish(queued.notification_type.as_str(), "success");
                    report.published.push(queued.id.clone());
                    envelopes[index] = queued;
                }
                Err(e) => {
                    let envelope = &mut envelopes[index];
                    envelope.mark_failed(e.to_string())?;
                    prom::record_publish(envelope.notification_type.as_str(), "failed");
                    warn!(
                        notification_id = %envelope.id,
                        error = %e,
                        "批内通知写入失败"
                    );
                    report.failed.push(envelope.id.clone());
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if report.published.is_empty() => {
                error!(
                    batch_size = report.failed.len(),
                    error = %e,
                    "批量发布失败，批内通知全部标记为失败"
                );
                Err(e.into())
            }
            _ => {
                info!(
                    published = report.published.len(),
                    skipped = report.skipped.len(),
                    failed = report.failed.len(),
                    "批量通知已发布"
                );
                Ok(report)
            }
        }
    }

    /// 计划在指定时间投递
    ///
    /// 消费端收到后会等到计划时间再投递；计划时间晚于过期时间时拒绝发布。
    pub async fn publish_scheduled(
        &self,
        envelope: &mut NotificationEnvelope,
        at: DateTime<Utc>,
    ) -> Result<DeliveryReceipt> {
        if envelope.status != NotificationStatus::Pending {
            return Err(NotificationError::NotPublishable(envelope.status));
        }
        if let Some(expires_at) = envelope.expires_at
            && at > expires_at
        {
            return Err(NotificationError::Validation(format!(
                "计划时间 {at} 晚于过期时间 {expires_at}"
            )));
        }

        let previous = envelope.scheduled_for.replace(at);
        match self.publish(envelope).await {
            Ok(receipt) => Ok(receipt),
            Err(
                e @ (NotificationError::Serialization(_) | NotificationError::NotPublishable(_)),
            ) => {
                // 未发送的信封保持原样
                envelope.scheduled_for = previous;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// 把已入队、未到计划时间的信封按原样追加到 topic 末尾
    pub async fn requeue(&self, envelope: &NotificationEnvelope) -> Result<DeliveryReceipt> {
        if envelope.status != NotificationStatus::Queued {
            return Err(NotificationError::NotPublishable(envelope.status));
        }
        let record = self.record_for(envelope, envelope.encode()?);
        let receipt = self.producer.send(record).await?;
        prom::record_publish(envelope.notification_type.as_str(), "requeued");
        Ok(receipt)
    }

    /// 不产生 broker 流量的自检：合成信封能完整编解码，且必要配置齐全
    pub fn health_check(&self) -> HealthStatus {
        if self.brokers.is_empty() {
            return HealthStatus::unhealthy("未配置 broker 地址");
        }
        if self.topic.trim().is_empty() {
            return HealthStatus::unhealthy("未配置通知 topic");
        }
        if self.producer_id.trim().is_empty() {
            return HealthStatus::unhealthy("未配置生产者标识");
        }

        let probe = NotificationBuilder::new()
            .notification_type(NotificationType::BookingConfirmed)
            .recipient("health-check", "health-check@localhost")
            .payload_value("probe", true)
            .build();
        let round_trip = probe.and_then(|envelope| {
            let decoded = NotificationEnvelope::decode(&envelope.encode()?)?;
            Ok(decoded == envelope)
        });

        match round_trip {
            Ok(true) => HealthStatus::Healthy,
            Ok(false) => HealthStatus::unhealthy("信封编解码结果不一致"),
            Err(e) => HealthStatus::unhealthy(format!("信封编解码失败: {e}")),
        }
    }

    /// 构造 QUEUED 副本及其 broker 消息，不修改原信封
    fn prepare(
        &self,
        envelope: &NotificationEnvelope,
    ) -> Result<(NotificationEnvelope, ProducerRecord)> {
        if envelope.status != NotificationStatus::Pending {
            return Err(NotificationError::NotPublishable(envelope.status));
        }

        let mut queued = envelope.clone();
        queued.transition(NotificationStatus::Queued)?;
        let payload = queued.encode()?;
        let record = self.record_for(&queued, payload);

        debug!(
            notification_id = %queued.id,
            bytes = record.payload.len(),
            "通知已序列化"
        );
        Ok((queued, record))
    }

    fn record_for(&self, envelope: &NotificationEnvelope, payload: Vec<u8>) -> ProducerRecord {
        let mut record = ProducerRecord::new(&self.topic, envelope.partition_key(), payload)
            .with_header("notification-id", &envelope.id)
            .with_header("notification-type", envelope.notification_type.as_str())
            .with_header("priority", envelope.priority.as_str())
            .with_header("recipient-id", &envelope.user_id)
            .with_header("recipient-email", &envelope.email)
            .with_header("channels", envelope.channel_list())
            .with_header("schema-version", SCHEMA_VERSION)
            .with_header("producer", &self.producer_id)
            .with_header("created-at", envelope.created_at.to_rfc3339());

        let optional = [
            ("scheduled-for", envelope.scheduled_for.map(|t| t.to_rfc3339())),
            ("event-id", envelope.event_id.clone()),
            ("booking-id", envelope.booking_id.clone()),
            ("waitlist-entry-id", envelope.waitlist_entry_id.clone()),
            ("expires-at", envelope.expires_at.map(|t| t.to_rfc3339())),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                record = record.with_header(key, value);
            }
        }
        record
    }
}
