//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为 [`MessageProducer`] / [`MessageConsumer`] 实现，
//! 统一错误映射、位点确认和关闭语义，避免各服务重复编写样板代码。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::broker::{
    ConsumerFactory, ConsumerMessage, DeliveryReceipt, MessageConsumer, MessageProducer,
    ProducerRecord,
};
use crate::config::KafkaConfig;
use crate::error::{InfraError, Result};

/// 将 rdkafka 的借用消息（带生命周期约束）转换为拥有所有权的结构体
fn owned_message(msg: &BorrowedMessage<'_>) -> ConsumerMessage {
    let key = msg
        .key()
        .and_then(|k| std::str::from_utf8(k).ok())
        .map(String::from);

    let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for idx in 0..h.count() {
            let header = h.get(idx);
            if let Some(raw) = header.value
                && let Ok(value) = std::str::from_utf8(raw)
            {
                headers.insert(header.key.to_string(), value.to_string());
            }
        }
    }

    ConsumerMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key,
        payload,
        timestamp: msg.timestamp().to_millis(),
        headers,
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 等待所有 ISR 副本确认（`acks=all`）并开启幂等写入，生产端内部重试不会在 broker
/// 上产生重复消息。`FutureProducer` 本身是 Arc 包装的，可直接 Clone 共享。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.producer_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", config.send_timeout_ms.to_string())
            .create()
            .map_err(|e| InfraError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            producer_id = %config.producer_id,
            "Kafka 生产者已初始化"
        );
        Ok(Self {
            producer,
            send_timeout: config.send_timeout(),
        })
    }
}

#[async_trait]
impl MessageProducer for KafkaProducer {
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReceipt> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let future_record = FutureRecord::to(&record.topic)
            .key(record.key.as_str())
            .payload(record.payload.as_slice())
            .headers(headers);

        let delivery = self
            .producer
            .send(future_record, self.send_timeout)
            .await
            .map_err(|(e, _)| InfraError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic = %record.topic,
            key = %record.key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok(DeliveryReceipt {
            partition: delivery.partition,
            offset: delivery.offset,
        })
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer
            .flush(timeout)
            .map_err(|e| InfraError::Kafka(format!("刷新生产者失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 消费组中的一个 Kafka 成员
///
/// 关闭自动存储位点（`enable.auto.offset.store=false`），只有业务调用 `ack` 后位点才会被
/// 后台自动提交。处理中途崩溃的消息因此会被重新投递给组内其他成员。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    pub fn new(config: &KafkaConfig, topic: &str, member_index: usize) -> Result<Self> {
        let client_id = format!("{}-consumer-{}", config.producer_id, member_index);

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("client.id", &client_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| InfraError::Kafka(format!("创建消费者失败: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| InfraError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.consumer_group,
            client_id,
            topic,
            "Kafka 消费者已加入消费组"
        );
        Ok(Self { consumer })
    }
}

#[async_trait]
impl MessageConsumer for KafkaConsumer {
    async fn poll(&self, timeout: Duration) -> Result<Option<ConsumerMessage>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(msg)) => {
                let msg = owned_message(&msg);
                debug!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    "收到 Kafka 消息"
                );
                Ok(Some(msg))
            }
            Ok(Err(e)) => Err(InfraError::Kafka(format!("接收 Kafka 消息出错: {e}"))),
        }
    }

    fn ack(&self, message: &ConsumerMessage) -> Result<()> {
        // 存储的是下一条待消费的位点
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )
        .map_err(|e| InfraError::Kafka(format!("构造位点失败: {e}")))?;

        self.consumer
            .store_offsets(&tpl)
            .map_err(|e| InfraError::Kafka(format!("存储位点失败: {e}")))
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            // 没有新位点可提交时 librdkafka 也会返回错误，不影响关闭
            warn!(error = %e, "关闭前提交位点失败");
        }
        self.consumer.unsubscribe();
        info!("Kafka 消费者已离开消费组");
        Ok(())
    }
}

/// 按配置为每个 worker 创建独立的 Kafka 消费者
pub struct KafkaConsumerFactory {
    config: KafkaConfig,
    topic: String,
}

impl KafkaConsumerFactory {
    pub fn new(config: KafkaConfig) -> Self {
        let topic = config.topic.clone();
        Self { config, topic }
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    fn create(&self, member_index: usize) -> Result<Box<dyn MessageConsumer>> {
        Ok(Box::new(KafkaConsumer::new(
            &self.config,
            &self.topic,
            member_index,
        )?))
    }
}
