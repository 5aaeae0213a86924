//! 通知信封
//!
//! 一条通知从构建、发布到投递的全部状态都记录在信封里，
//! 投递历史随信封在管道中流转，不依赖独立的持久化存储。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{NotificationError, Result};

// ---------------------------------------------------------------------------
// 分类枚举
// ---------------------------------------------------------------------------

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    WaitlistSpotAvailable,
    WaitlistPositionUpdate,
    WaitlistSpotExpired,
    BookingConfirmed,
    BookingCancelled,
    EventReminder,
    EventUpdated,
    EventCancelled,
}

impl NotificationType {
    pub const ALL: [NotificationType; 8] = [
        Self::WaitlistSpotAvailable,
        Self::WaitlistPositionUpdate,
        Self::WaitlistSpotExpired,
        Self::BookingConfirmed,
        Self::BookingCancelled,
        Self::EventReminder,
        Self::EventUpdated,
        Self::EventCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitlistSpotAvailable => "WAITLIST_SPOT_AVAILABLE",
            Self::WaitlistPositionUpdate => "WAITLIST_POSITION_UPDATE",
            Self::WaitlistSpotExpired => "WAITLIST_SPOT_EXPIRED",
            Self::BookingConfirmed => "BOOKING_CONFIRMED",
            Self::BookingCancelled => "BOOKING_CANCELLED",
            Self::EventReminder => "EVENT_REMINDER",
            Self::EventUpdated => "EVENT_UPDATED",
            Self::EventCancelled => "EVENT_CANCELLED",
        }
    }

    /// 类型对应的默认优先级
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::WaitlistPositionUpdate => Priority::Low,
            Self::WaitlistSpotExpired | Self::EventReminder | Self::EventUpdated => {
                Priority::Medium
            }
            Self::WaitlistSpotAvailable | Self::BookingConfirmed | Self::BookingCancelled => {
                Priority::High
            }
            Self::EventCancelled => Priority::Critical,
        }
    }

    /// 类型对应的默认渠道集合
    pub fn default_channels(&self) -> Vec<Channel> {
        match self {
            Self::WaitlistSpotAvailable => vec![Channel::Email, Channel::Sms],
            Self::EventReminder => vec![Channel::Email, Channel::Push],
            Self::EventCancelled => vec![Channel::Email, Channel::Sms, Channel::Push],
            _ => vec![Channel::Email],
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 投递渠道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

impl Channel {
    /// 未指定渠道时注入的默认渠道
    pub const DEFAULT: Channel = Channel::Email;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
            Self::Push => "PUSH",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// 状态机
// ---------------------------------------------------------------------------

/// 通知状态
///
/// ```text
/// PENDING → QUEUED → SENDING → SENT → DELIVERED
///    │         │         ├──→ FAILED → EXPIRED
///    └─────────┴──→ FAILED └──→ PARTIALLY_DELIVERED
/// 任意非终态 → EXPIRED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Queued,
    Sending,
    Sent,
    Delivered,
    Failed,
    PartiallyDelivered,
    Expired,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Sending => "SENDING",
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
            Self::PartiallyDelivered => "PARTIALLY_DELIVERED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::Failed | Self::PartiallyDelivered | Self::Expired
        )
    }

    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        match (self, next) {
            (Pending, Queued | Failed) => true,
            (Queued, Sending | Failed) => true,
            (Sending, Sent | Failed | PartiallyDelivered) => true,
            (Sent, Delivered) => true,
            // 重试预算耗尽的失败信封再次到达时进入 EXPIRED
            (Failed, Expired) => true,
            (from, Expired) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// 投递记录
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Delivered,
    Failed,
}

/// 单次渠道投递尝试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttempt {
    pub channel: Channel,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 渠道返回的消息标识
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl DeliveryAttempt {
    pub fn delivered(channel: Channel, message_id: impl Into<String>) -> Self {
        Self {
            channel,
            attempted_at: Utc::now(),
            outcome: AttemptOutcome::Delivered,
            error: None,
            message_id: Some(message_id.into()),
        }
    }

    pub fn failed(channel: Channel, error: impl Into<String>) -> Self {
        Self {
            channel,
            attempted_at: Utc::now(),
            outcome: AttemptOutcome::Failed,
            error: Some(error.into()),
            message_id: None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.outcome == AttemptOutcome::Delivered
    }
}

// ---------------------------------------------------------------------------
// NotificationEnvelope
// ---------------------------------------------------------------------------

/// 通知信封
///
/// 通过 [`crate::builder::NotificationBuilder`] 构建。分区键是接收者 ID，
/// 构建后不再变化，同一接收者的通知因此严格按发布顺序被消费。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEnvelope {
    pub id: String,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub channels: Vec<Channel>,

    // 接收者
    pub user_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    // 内容
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub payload: BTreeMap<String, serde_json::Value>,

    // 业务上下文
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waitlist_entry_id: Option<String>,

    // 时间约束
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    // 投递跟踪
    pub status: NotificationStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub attempts: Vec<DeliveryAttempt>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl NotificationEnvelope {
    /// 分区键
    pub fn partition_key(&self) -> &str {
        &self.user_id
    }

    /// 按状态机推进状态，非法流转返回错误且不修改信封
    pub fn transition(&mut self, next: NotificationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(NotificationError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            NotificationStatus::Sent => self.sent_at = Some(now),
            NotificationStatus::Delivered => self.delivered_at = Some(now),
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// 标记为失败并记录原因
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(NotificationStatus::Failed)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// 渠道回执确认送达
    pub fn mark_delivered(&mut self) -> Result<()> {
        self.transition(NotificationStatus::Delivered)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// 尚未到达计划发送时间
    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.is_some_and(|at| at > now)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn record_attempt(&mut self, attempt: DeliveryAttempt) {
        self.attempts.push(attempt);
        self.updated_at = Utc::now();
    }

    /// 某个渠道的投递记录
    pub fn attempts_for(&self, channel: Channel) -> impl Iterator<Item = &DeliveryAttempt> {
        self.attempts.iter().filter(move |a| a.channel == channel)
    }

    /// 逗号拼接的渠道列表，用于消息头
    pub fn channel_list(&self) -> String {
        self.channels
            .iter()
            .map(Channel::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// 编码为规范 JSON
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 解码后补齐渠道：外部写入的消息可能不带渠道列表
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.channels.is_empty() {
            envelope.channels.push(Channel::DEFAULT);
        }
        Ok(envelope)
    }
}
