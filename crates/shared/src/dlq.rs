//! 死信队列
//!
//! 投递最终失败（或部分失败）的消息不会在主 topic 中自动重排，
//! 而是包装为 [`DeadLetterMessage`] 写入独立的死信 topic，供人工排查或回放。
//! 回放时原始负载按原 key 发回主 topic，保持同一接收者的顺序。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::{DeliveryReceipt, MessageProducer, ProducerRecord};
use crate::error::{InfraError, Result};

// ---------------------------------------------------------------------------
// DeadLetterMessage
// ---------------------------------------------------------------------------

/// 死信消息信封
///
/// 包装原始消息，附加失败原因、重试次数等元数据。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息 ID（通知 ID）
    pub message_id: String,
    /// 原始分区键，回放时沿用
    pub key: String,
    pub source_topic: String,
    /// 原始消息内容（JSON 字符串）
    pub payload: String,
    /// 失败原因
    pub error: String,
    /// 已使用的重试次数
    pub retry_count: u32,
    pub max_retries: u32,
    pub failed_at: DateTime<Utc>,
    /// 来源服务
    pub source_service: String,
}

impl DeadLetterMessage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_id: impl Into<String>,
        key: impl Into<String>,
        source_topic: impl Into<String>,
        payload: impl Into<String>,
        error: impl Into<String>,
        retry_count: u32,
        max_retries: u32,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            key: key.into(),
            source_topic: source_topic.into(),
            payload: payload.into(),
            error: error.into(),
            retry_count,
            max_retries,
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }

    /// 重试预算是否已经耗尽
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

// ---------------------------------------------------------------------------
// DlqProducer
// ---------------------------------------------------------------------------

/// 死信生产者，与业务生产者共享同一个 broker 句柄
pub struct DlqProducer {
    producer: Arc<dyn MessageProducer>,
    topic: String,
    source_service: String,
}

impl DlqProducer {
    pub fn new(
        producer: Arc<dyn MessageProducer>,
        topic: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            source_service: source_service.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn source_service(&self) -> &str {
        &self.source_service
    }

    /// 将死信写入死信 topic
    pub async fn send(&self, message: &DeadLetterMessage) -> Result<DeliveryReceipt> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| InfraError::Serialization(format!("序列化死信失败: {e}")))?;

        let record = ProducerRecord::new(&self.topic, &message.key, payload)
            .with_header("notification-id", &message.message_id)
            .with_header("source-topic", &message.source_topic)
            .with_header("dead-letter-reason", &message.error);

        let receipt = self.producer.send(record).await?;

        warn!(
            message_id = %message.message_id,
            source_topic = %message.source_topic,
            retry_count = message.retry_count,
            error = %message.error,
            "消息已发送到死信队列"
        );
        Ok(receipt)
    }

    /// 将死信中的原始负载发回来源 topic
    pub async fn replay(&self, message: &DeadLetterMessage) -> Result<DeliveryReceipt> {
        let record = ProducerRecord::new(
            &message.source_topic,
            &message.key,
            message.payload.clone().into_bytes(),
        )
        .with_header("notification-id", &message.message_id)
        .with_header("replayed-from", &self.topic);

        let receipt = self.producer.send(record).await?;

        info!(
            message_id = %message.message_id,
            source_topic = %message.source_topic,
            "死信消息已回放到原始 topic"
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn sample() -> DeadLetterMessage {
        DeadLetterMessage::new(
            "n-001",
            "user-1",
            "ticketing.notifications",
            r#"{"id":"n-001"}"#,
            "SMTP 连接失败",
            3,
            3,
            "notification-service",
        )
    }

    #[test]
    fn test_dead_letter_message_creation() {
        let msg = sample();
        assert_eq!(msg.message_id, "n-001");
        assert_eq!(msg.key, "user-1");
        assert_eq!(msg.retry_count, 3);
        assert!(msg.is_exhausted());

        let partial = DeadLetterMessage {
            retry_count: 1,
            ..sample()
        };
        assert!(!partial.is_exhausted());
    }

    #[test]
    fn test_dead_letter_serialization() {
        let json = serde_json::to_string(&sample()).unwrap();

        // camelCase 序列化
        assert!(json.contains("messageId"));
        assert!(json.contains("sourceTopic"));
        assert!(json.contains("retryCount"));
        assert!(json.contains("failedAt"));

        let back: DeadLetterMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample_with_time(back.failed_at));
    }

    fn sample_with_time(failed_at: DateTime<Utc>) -> DeadLetterMessage {
        DeadLetterMessage {
            failed_at,
            ..sample()
        }
    }

    #[tokio::test]
    async fn test_send_and_replay() {
        let broker = MemoryBroker::new(2);
        let dlq = DlqProducer::new(
            Arc::new(broker.clone()),
            "ticketing.notifications.dlq",
            "notification-service",
        );

        dlq.send(&sample()).await.unwrap();
        let stored = broker.messages("ticketing.notifications.dlq");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].header("notification-id"), Some("n-001"));
        assert_eq!(stored[0].key.as_deref(), Some("user-1"));

        let parsed: DeadLetterMessage = stored[0].deserialize_payload().unwrap();
        dlq.replay(&parsed).await.unwrap();

        let replayed = broker.messages("ticketing.notifications");
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].payload, br#"{"id":"n-001"}"#);
        assert_eq!(
            replayed[0].header("replayed-from"),
            Some("ticketing.notifications.dlq")
        );
    }
}
