//! 消息 broker 抽象
//!
//! 将分区日志 broker 的生产、消费与位点确认抽象为 trait，业务层只依赖这些 trait。
//! Kafka 实现位于 [`crate::kafka`]，进程内实现位于 [`crate::memory`]。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{InfraError, Result};

// ---------------------------------------------------------------------------
// ProducerRecord / DeliveryReceipt
// ---------------------------------------------------------------------------

/// 待发送的消息
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    /// 分区键，相同 key 的消息落在同一分区并保持顺序
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// broker 确认写入后返回的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub partition: i32,
    pub offset: i64,
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的消息的统一表示
///
/// 拥有所有字段的所有权，可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 将负载视为 UTF-8 字符串返回
    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| InfraError::Serialization(format!("负载非 UTF-8 编码: {e}")))
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| InfraError::Serialization(format!("负载反序列化失败: {e}")))
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// 生产者：句柄可被所有发布点并发共享
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// 发送单条消息，等待 broker 确认
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReceipt>;

    /// 批量发送，按输入顺序返回每条消息各自的确认结果
    ///
    /// 已被 broker 接收的消息不会因同批其他消息失败而撤回，调用方需逐条处理结果。
    /// 按列表顺序入队，同一 key 的相对顺序得以保持。
    async fn send_batch(&self, records: Vec<ProducerRecord>) -> Vec<Result<DeliveryReceipt>> {
        let sends = records.into_iter().map(|record| self.send(record));
        futures::future::join_all(sends).await
    }

    /// 刷新尚未确认的消息，关闭前调用
    fn flush(&self, timeout: Duration) -> Result<()>;
}

/// 消费组中的一个成员会话
///
/// broker 为每个成员分配互不重叠的分区；成员离开后，未确认的消息会重新分配给其他成员。
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// 拉取下一条消息，`timeout` 内没有消息时返回 `Ok(None)`
    async fn poll(&self, timeout: Duration) -> Result<Option<ConsumerMessage>>;

    /// 确认消息已处理完毕，推进该分区的提交位点
    fn ack(&self, message: &ConsumerMessage) -> Result<()>;

    /// 提交已确认的位点并离开消费组
    async fn close(&self) -> Result<()>;
}

/// 为工作池中的每个 worker 创建独立的消费组成员
pub trait ConsumerFactory: Send + Sync {
    fn create(&self, member_index: usize) -> Result<Box<dyn MessageConsumer>>;
}
