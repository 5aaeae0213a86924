//! 短信渠道
//!
//! 模拟发送，仅记录日志。接入短信服务商时只需替换 `handle` 的实现。

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{ChannelHandler, ChannelReceipt};
use crate::envelope::{Channel, NotificationEnvelope};
use crate::error::{NotificationError, Result};

pub struct SmsHandler;

#[async_trait]
impl ChannelHandler for SmsHandler {
    async fn handle(&self, envelope: &NotificationEnvelope) -> Result<ChannelReceipt> {
        // 没有手机号重试也不会成功
        let phone = envelope
            .phone
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                NotificationError::InvalidAddress(format!("通知 {} 缺少手机号", envelope.id))
            })?;

        let message_id = Uuid::now_v7().to_string();
        info!(
            channel = "SMS",
            notification_id = %envelope.id,
            user_id = %envelope.user_id,
            phone,
            message_id = %message_id,
            "模拟发送短信通知"
        );

        Ok(ChannelReceipt::new(message_id))
    }

    fn channel(&self) -> Channel {
        Channel::Sms
    }
}
