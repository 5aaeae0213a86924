//! 进程内分区日志 broker
//!
//! 与 Kafka 保持相同的语义，用于测试和无外部依赖的本地运行：
//! - 按 key 哈希选择分区，同一 key 的消息严格有序
//! - 同一消费组内按成员轮转分配分区，一个分区同一时刻只属于一个成员
//! - 只有 `ack` 过的位点才会提交；成员加入或离开都会触发重平衡，
//!   各成员的读取位置回退到已提交位点，未确认的消息因此被重新投递

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use crate::broker::{
    ConsumerFactory, ConsumerMessage, DeliveryReceipt, MessageConsumer, MessageProducer,
    ProducerRecord,
};
use crate::error::{InfraError, Result};

/// 空闲时的轮询间隔
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
    timestamp: i64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// 成员按加入顺序排列，分区 p 分配给 members[p % len]
    members: Vec<u64>,
    /// (topic, partition) -> 下一条待消费的位点
    committed: HashMap<(String, i32), i64>,
    /// (member, topic, partition) -> 成员当前读取位置
    positions: HashMap<(u64, String, i32), i64>,
}

impl GroupState {
    /// 只保留分配关系未变的分区的读取位置，其余分区从已提交位点重新开始
    fn rebalance(&mut self) {
        let members = self.members.clone();
        self.positions.retain(|(member, _, partition), _| {
            !members.is_empty() && members[*partition as usize % members.len()] == *member
        });
    }

    fn owner_of(&self, partition: i32) -> Option<u64> {
        if self.members.is_empty() {
            return None;
        }
        Some(self.members[partition as usize % self.members.len()])
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    groups: HashMap<String, GroupState>,
    next_member_id: u64,
    /// 注入的发送故障次数，测试用
    failing_sends: u32,
}

/// 进程内 broker，Clone 后共享同一份日志
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    partitions: usize,
}

impl MemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            partitions: partitions.max(1),
        }
    }

    /// 与 Kafka 默认分区器一样，相同 key 总是落在同一分区
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }

    /// 让接下来的 `count` 次发送失败
    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().failing_sends = count;
    }

    /// topic 中的消息总数
    pub fn message_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|parts| parts.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// 读取 topic 中的全部消息（按分区、位点排序），不影响任何消费组
    pub fn messages(&self, topic: &str) -> Vec<ConsumerMessage> {
        let state = self.state.lock();
        let Some(parts) = state.topics.get(topic) else {
            return Vec::new();
        };
        parts
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records
                    .iter()
                    .enumerate()
                    .map(move |(offset, record)| {
                        to_message(topic, partition as i32, offset as i64, record)
                    })
            })
            .collect()
    }

    /// 消费组在某分区上已提交的位点
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .groups
            .get(group)
            .and_then(|g| g.committed.get(&(topic.to_string(), partition)).copied())
    }

    /// 以新成员身份加入消费组
    pub fn join(&self, group: &str, topic: &str) -> MemoryConsumer {
        let mut state = self.state.lock();
        state.next_member_id += 1;
        let member_id = state.next_member_id;

        let group_state = state.groups.entry(group.to_string()).or_default();
        group_state.members.push(member_id);
        group_state.rebalance();

        debug!(group, topic, member_id, "成员加入消费组");
        MemoryConsumer {
            broker: self.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            member_id,
        }
    }

    pub fn consumer_factory(&self, group: &str, topic: &str) -> MemoryConsumerFactory {
        MemoryConsumerFactory {
            broker: self.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
        }
    }

    fn append(&self, record: ProducerRecord) -> Result<DeliveryReceipt> {
        let partition = self.partition_for(&record.key);
        let mut state = self.state.lock();

        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(InfraError::Kafka("broker 不可达（注入故障）".to_string()));
        }

        let partitions = self.partitions;
        let log = state
            .topics
            .entry(record.topic.clone())
            .or_insert_with(|| vec![Vec::new(); partitions]);
        let records = &mut log[partition as usize];
        records.push(StoredRecord {
            key: record.key,
            payload: record.payload,
            headers: record.headers.into_iter().collect(),
            timestamp: Utc::now().timestamp_millis(),
        });

        Ok(DeliveryReceipt {
            partition,
            offset: records.len() as i64 - 1,
        })
    }

    /// 取出成员所属分区中的下一条消息并推进读取位置
    fn next_for(
        &self,
        group: &str,
        topic: &str,
        member_id: u64,
    ) -> Result<Option<ConsumerMessage>> {
        let mut state = self.state.lock();
        let BrokerState { topics, groups, .. } = &mut *state;

        let group_state = groups.get_mut(group).ok_or(InfraError::ConsumerClosed)?;
        if !group_state.members.contains(&member_id) {
            return Err(InfraError::ConsumerClosed);
        }
        let Some(log) = topics.get(topic) else {
            return Ok(None);
        };

        for (partition, records) in log.iter().enumerate() {
            let partition = partition as i32;
            if group_state.owner_of(partition) != Some(member_id) {
                continue;
            }
            let committed = group_state
                .committed
                .get(&(topic.to_string(), partition))
                .copied()
                .unwrap_or(0);
            let position = group_state
                .positions
                .entry((member_id, topic.to_string(), partition))
                .or_insert(committed);

            if let Some(record) = records.get(*position as usize) {
                let msg = to_message(topic, partition, *position, record);
                *position += 1;
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    fn commit(&self, group: &str, member_id: u64, message: &ConsumerMessage) -> Result<()> {
        let mut state = self.state.lock();
        let group_state = state.groups.get_mut(group).ok_or(InfraError::ConsumerClosed)?;

        // 分区已被重新分配时丢弃过期确认，与 Kafka 拒绝旧代提交一致
        if group_state.owner_of(message.partition) != Some(member_id) {
            return Ok(());
        }
        let entry = group_state
            .committed
            .entry((message.topic.clone(), message.partition))
            .or_insert(0);
        *entry = (*entry).max(message.offset + 1);
        Ok(())
    }

    fn leave(&self, group: &str, member_id: u64) {
        let mut state = self.state.lock();
        if let Some(group_state) = state.groups.get_mut(group)
            && group_state.members.contains(&member_id)
        {
            group_state.members.retain(|m| *m != member_id);
            group_state.rebalance();
            debug!(group, member_id, "成员离开消费组");
        }
    }
}

fn to_message(topic: &str, partition: i32, offset: i64, record: &StoredRecord) -> ConsumerMessage {
    ConsumerMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key: Some(record.key.clone()),
        payload: record.payload.clone(),
        timestamp: Some(record.timestamp),
        headers: record.headers.clone(),
    }
}

#[async_trait]
impl MessageProducer for MemoryBroker {
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReceipt> {
        self.append(record)
    }

    async fn send_batch(&self, records: Vec<ProducerRecord>) -> Vec<Result<DeliveryReceipt>> {
        // 与 Kafka 一致：逐条写入，注入的故障只影响对应的那几条
        records.into_iter().map(|r| self.append(r)).collect()
    }

    fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryConsumer
// ---------------------------------------------------------------------------

/// 进程内消费组成员
pub struct MemoryConsumer {
    broker: MemoryBroker,
    group: String,
    topic: String,
    member_id: u64,
}

impl MemoryConsumer {
    pub fn member_id(&self) -> u64 {
        self.member_id
    }
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn poll(&self, timeout: Duration) -> Result<Option<ConsumerMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(msg) = self.broker.next_for(&self.group, &self.topic, self.member_id)? {
                return Ok(Some(msg));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    fn ack(&self, message: &ConsumerMessage) -> Result<()> {
        self.broker.commit(&self.group, self.member_id, message)
    }

    async fn close(&self) -> Result<()> {
        self.broker.leave(&self.group, self.member_id);
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        // 未显式关闭的成员（如 worker 被中止）同样要让出分区
        self.broker.leave(&self.group, self.member_id);
    }
}

/// 每次调用都以新成员身份加入同一消费组
pub struct MemoryConsumerFactory {
    broker: MemoryBroker,
    group: String,
    topic: String,
}

impl ConsumerFactory for MemoryConsumerFactory {
    fn create(&self, _member_index: usize) -> Result<Box<dyn MessageConsumer>> {
        Ok(Box::new(self.broker.join(&self.group, &self.topic)))
    }
}
