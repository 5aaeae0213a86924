//! 通知信封构建器
//!
//! 流式累积可选字段，默认值集中在设置类型这一步：
//! 类型决定默认优先级，调用方未指定渠道时也决定默认渠道集合。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::envelope::{
    Channel, NotificationEnvelope, NotificationStatus, NotificationType, Priority,
};
use crate::error::{NotificationError, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 通知接收者
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

impl Recipient {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            name: None,
            phone: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationBuilder {
    notification_type: Option<NotificationType>,
    priority: Option<Priority>,
    channels: Option<Vec<Channel>>,
    user_id: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    name: Option<String>,
    subject: Option<String>,
    template_id: Option<String>,
    payload: BTreeMap<String, serde_json::Value>,
    event_id: Option<String>,
    booking_id: Option<String>,
    waitlist_entry_id: Option<String>,
    scheduled_for: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    max_retries: Option<u32>,
}

impl NotificationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置类型，同时赋予默认优先级；渠道尚未指定时赋予默认渠道集合
    pub fn notification_type(mut self, notification_type: NotificationType) -> Self {
        self.notification_type = Some(notification_type);
        self.priority = Some(notification_type.default_priority());
        if self.channels.is_none() {
            self.channels = Some(notification_type.default_channels());
        }
        self
    }

    /// 覆盖类型默认优先级，需在设置类型之后调用
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// 指定渠道集合，重复项会被去除
    pub fn channels(mut self, channels: impl IntoIterator<Item = Channel>) -> Self {
        let mut unique: Vec<Channel> = Vec::new();
        for channel in channels {
            if !unique.contains(&channel) {
                unique.push(channel);
            }
        }
        self.channels = Some(unique);
        self
    }

    pub fn add_channel(mut self, channel: Channel) -> Self {
        let channels = self.channels.get_or_insert_with(Vec::new);
        if !channels.contains(&channel) {
            channels.push(channel);
        }
        self
    }

    pub fn recipient(mut self, user_id: impl Into<String>, email: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.email = Some(email.into());
        self
    }

    pub fn to(mut self, recipient: Recipient) -> Self {
        self.user_id = Some(recipient.user_id);
        self.email = Some(recipient.email);
        if recipient.name.is_some() {
            self.name = recipient.name;
        }
        if recipient.phone.is_some() {
            self.phone = recipient.phone;
        }
        self
    }

    pub fn phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn template_id(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    /// 合并一个负载字段，同名字段后写覆盖先写
    pub fn payload_value(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// 合并整个负载映射
    pub fn payload(
        mut self,
        payload: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Self {
        self.payload.extend(payload);
        self
    }

    pub fn event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn booking_id(mut self, booking_id: impl Into<String>) -> Self {
        self.booking_id = Some(booking_id.into());
        self
    }

    pub fn waitlist_entry_id(mut self, waitlist_entry_id: impl Into<String>) -> Self {
        self.waitlist_entry_id = Some(waitlist_entry_id.into());
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// 未显式设置重试上限时使用的值
    pub fn default_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries.get_or_insert(max_retries);
        self
    }

    /// 构建信封
    ///
    /// 缺少类型、接收者 ID 或邮箱时返回校验错误，列出全部缺失项。
    pub fn build(self) -> Result<NotificationEnvelope> {
        let user_id = self.user_id.filter(|s| !s.trim().is_empty());
        let email = self.email.filter(|s| !s.trim().is_empty());

        let (notification_type, user_id, email) = match (self.notification_type, user_id, email) {
            (Some(t), Some(u), Some(e)) => (t, u, e),
            (t, u, e) => {
                let missing: Vec<&str> = [
                    (t.is_none(), "notification_type"),
                    (u.is_none(), "user_id"),
                    (e.is_none(), "email"),
                ]
                .into_iter()
                .filter_map(|(absent, field)| absent.then_some(field))
                .collect();
                return Err(NotificationError::Validation(format!(
                    "缺少必填字段: {}",
                    missing.join(", ")
                )));
            }
        };

        let mut channels = self.channels.unwrap_or_default();
        if channels.is_empty() {
            channels.push(Channel::DEFAULT);
        }

        let now = Utc::now();
        Ok(NotificationEnvelope {
            id: Uuid::now_v7().to_string(),
            notification_type,
            priority: self
                .priority
                .unwrap_or_else(|| notification_type.default_priority()),
            channels,
            user_id,
            email,
            phone: self.phone,
            name: self.name,
            subject: self.subject.unwrap_or_default(),
            template_id: self.template_id,
            payload: self.payload,
            event_id: self.event_id,
            booking_id: self.booking_id,
            waitlist_entry_id: self.waitlist_entry_id,
            scheduled_for: self.scheduled_for,
            expires_at: self.expires_at,
            status: NotificationStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            last_error: None,
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
            sent_at: None,
            delivered_at: None,
        })
    }
}

// ---------------------------------------------------------------------------
// 常用通知的便捷构造
// ---------------------------------------------------------------------------

impl NotificationBuilder {
    /// 候补名额释放，认领截止后通知失效
    pub fn waitlist_spot_available(
        recipient: Recipient,
        event_id: impl Into<String>,
        waitlist_entry_id: impl Into<String>,
        event_name: impl Into<String>,
        claim_deadline: DateTime<Utc>,
    ) -> Self {
        let event_name = event_name.into();
        Self::new()
            .notification_type(NotificationType::WaitlistSpotAvailable)
            .to(recipient)
            .subject(format!("A spot opened up for {event_name}"))
            .event_id(event_id)
            .waitlist_entry_id(waitlist_entry_id)
            .payload_value("event_name", event_name)
            .payload_value("claim_deadline", claim_deadline.to_rfc3339())
            .expires_at(claim_deadline)
    }

    pub fn waitlist_position_update(
        recipient: Recipient,
        event_id: impl Into<String>,
        waitlist_entry_id: impl Into<String>,
        event_name: impl Into<String>,
        position: u32,
    ) -> Self {
        let event_name = event_name.into();
        Self::new()
            .notification_type(NotificationType::WaitlistPositionUpdate)
            .to(recipient)
            .subject(format!("Your waitlist position for {event_name}"))
            .event_id(event_id)
            .waitlist_entry_id(waitlist_entry_id)
            .payload_value("event_name", event_name)
            .payload_value("position", position)
    }

    pub fn booking_confirmed(
        recipient: Recipient,
        event_id: impl Into<String>,
        booking_id: impl Into<String>,
        event_name: impl Into<String>,
        ticket_count: u32,
    ) -> Self {
        let event_name = event_name.into();
        Self::new()
            .notification_type(NotificationType::BookingConfirmed)
            .to(recipient)
            .subject(format!("Booking confirmed: {event_name}"))
            .event_id(event_id)
            .booking_id(booking_id)
            .payload_value("event_name", event_name)
            .payload_value("ticket_count", ticket_count)
    }

    pub fn booking_cancelled(
        recipient: Recipient,
        event_id: impl Into<String>,
        booking_id: impl Into<String>,
        event_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let event_name = event_name.into();
        Self::new()
            .notification_type(NotificationType::BookingCancelled)
            .to(recipient)
            .subject(format!("Booking cancelled: {event_name}"))
            .event_id(event_id)
            .booking_id(booking_id)
            .payload_value("event_name", event_name)
            .payload_value("reason", reason.into())
    }

    /// 活动提醒，活动开始后提醒失效
    pub fn event_reminder(
        recipient: Recipient,
        event_id: impl Into<String>,
        event_name: impl Into<String>,
        starts_at: DateTime<Utc>,
    ) -> Self {
        let event_name = event_name.into();
        Self::new()
            .notification_type(NotificationType::EventReminder)
            .to(recipient)
            .subject(format!("Reminder: {event_name} is coming up"))
            .event_id(event_id)
            .payload_value("event_name", event_name)
            .payload_value("starts_at", starts_at.to_rfc3339())
            .expires_at(starts_at)
    }

    pub fn event_cancelled(
        recipient: Recipient,
        event_id: impl Into<String>,
        event_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let event_name = event_name.into();
        Self::new()
            .notification_type(NotificationType::EventCancelled)
            .to(recipient)
            .subject(format!("{event_name} has been cancelled"))
            .event_id(event_id)
            .payload_value("event_name", event_name)
            .payload_value("reason", reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_type_sets_defaults() {
        let env = NotificationBuilder::new()
            .notification_type(NotificationType::WaitlistSpotAvailable)
            .recipient("user-1", "a@example.com")
            .build()
            .unwrap();

        assert_eq!(env.priority, Priority::High);
        assert_eq!(env.channels, vec![Channel::Email, Channel::Sms]);
        assert_eq!(env.status, NotificationStatus::Pending);
        assert_eq!(env.max_retries, DEFAULT_MAX_RETRIES);
        assert!(env.payload.is_empty());
        assert_eq!(env.created_at, env.updated_at);
    }

    #[test]
    fn test_explicit_channels_survive_type() {
        let env = NotificationBuilder::new()
            .channels([Channel::Push, Channel::Push, Channel::Email])
            .notification_type(NotificationType::WaitlistSpotAvailable)
            .recipient("user-1", "a@example.com")
            .build()
            .unwrap();

        // 先指定的渠道不被类型默认值覆盖，且已去重
        assert_eq!(env.channels, vec![Channel::Push, Channel::Email]);
    }

    #[test]
    fn test_empty_channels_get_default() {
        let env = NotificationBuilder::new()
            .channels(Vec::<Channel>::new())
            .notification_type(NotificationType::BookingConfirmed)
            .recipient("user-1", "a@example.com")
            .build()
            .unwrap();
        assert_eq!(env.channels, vec![Channel::Email]);
    }

    #[test]
    fn test_priority_override() {
        let env = NotificationBuilder::new()
            .notification_type(NotificationType::WaitlistPositionUpdate)
            .priority(Priority::Critical)
            .recipient("user-1", "a@example.com")
            .build()
            .unwrap();
        assert_eq!(env.priority, Priority::Critical);
    }

    #[test]
    fn test_default_max_retries_does_not_override_explicit() {
        let base = NotificationBuilder::new()
            .notification_type(NotificationType::BookingConfirmed)
            .recipient("user-1", "a@example.com");

        let env = base.clone().default_max_retries(5).build().unwrap();
        assert_eq!(env.max_retries, 5);

        let env = base.max_retries(1).default_max_retries(5).build().unwrap();
        assert_eq!(env.max_retries, 1);
    }

    #[test]
    fn test_missing_required_fields() {
        let err = NotificationBuilder::new()
            .recipient("user-1", " ")
            .build()
            .unwrap_err();
        match err {
            NotificationError::Validation(msg) => {
                assert!(msg.contains("notification_type"));
                assert!(msg.contains("email"));
                assert!(!msg.contains("user_id"));
            }
            other => panic!("期望校验错误，实际为 {other:?}"),
        }
    }

    #[test]
    fn test_payload_and_context_are_additive() {
        let env = NotificationBuilder::new()
            .notification_type(NotificationType::BookingConfirmed)
            .recipient("user-1", "a@example.com")
            .payload_value("a", 1)
            .payload([("b".to_string(), serde_json::json!("two"))])
            .payload_value("a", 3)
            .event_id("evt-1")
            .booking_id("bk-1")
            .build()
            .unwrap();

        assert_eq!(env.payload.len(), 2);
        assert_eq!(env.payload["a"], serde_json::json!(3));
        assert_eq!(env.event_id.as_deref(), Some("evt-1"));
        assert_eq!(env.booking_id.as_deref(), Some("bk-1"));
        assert!(env.waitlist_entry_id.is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let build = || {
            NotificationBuilder::new()
                .notification_type(NotificationType::EventUpdated)
                .recipient("user-1", "a@example.com")
                .build()
                .unwrap()
        };
        assert_ne!(build().id, build().id);
    }

    #[test]
    fn test_waitlist_spot_available_constructor() {
        let deadline = Utc::now() + Duration::hours(2);
        let env = NotificationBuilder::waitlist_spot_available(
            Recipient::new("user-9", "w@example.com").with_phone("+15550100"),
            "evt-1",
            "wl-1",
            "Jazz Night",
            deadline,
        )
        .build()
        .unwrap();

        assert_eq!(env.notification_type, NotificationType::WaitlistSpotAvailable);
        assert_eq!(env.expires_at, Some(deadline));
        assert_eq!(env.phone.as_deref(), Some("+15550100"));
        assert_eq!(env.waitlist_entry_id.as_deref(), Some("wl-1"));
        assert_eq!(env.payload["event_name"], serde_json::json!("Jazz Night"));
        assert!(env.subject.contains("Jazz Night"));
    }

    #[test]
    fn test_event_reminder_expires_at_start() {
        let starts_at = Utc::now() + Duration::days(1);
        let env = NotificationBuilder::event_reminder(
            Recipient::new("user-1", "a@example.com").with_name("Alice"),
            "evt-1",
            "Opening Night",
            starts_at,
        )
        .build()
        .unwrap();

        assert_eq!(env.expires_at, Some(starts_at));
        assert_eq!(env.channels, vec![Channel::Email, Channel::Push]);
        assert_eq!(env.name.as_deref(), Some("Alice"));
    }
}
