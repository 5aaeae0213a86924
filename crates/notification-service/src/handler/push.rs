//! 推送渠道
//!
//! 模拟发送，仅记录日志。生产环境中替换为 APNs / FCM 等推送服务的调用。

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{ChannelHandler, ChannelReceipt};
use crate::envelope::{Channel, NotificationEnvelope};
use crate::error::Result;

pub struct PushHandler;

#[async_trait]
impl ChannelHandler for PushHandler {
    async fn handle(&self, envelope: &NotificationEnvelope) -> Result<ChannelReceipt> {
        let message_id = Uuid::now_v7().to_string();

        info!(
            channel = "PUSH",
            notification_id = %envelope.id,
            user_id = %envelope.user_id,
            notification_type = %envelope.notification_type,
            message_id = %message_id,
            "模拟发送推送通知"
        );

        Ok(ChannelReceipt::new(message_id))
    }

    fn channel(&self) -> Channel {
        Channel::Push
    }
}
