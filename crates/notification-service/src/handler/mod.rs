//! 渠道处理器与注册表
//!
//! 每个投递渠道实现 [`ChannelHandler`]，启动时注册到 [`HandlerRegistry`]，
//! 投递时按渠道路由。请求了但没有注册处理器的渠道视为"无事可做"，
//! 既不算成功也不算失败，允许先声明渠道后补处理器。
//!
//! ## 使用示例
//!
//! ```ignore
//! let registry = HandlerRegistry::new();
//! registry.register(Channel::Sms, Arc::new(SmsHandler))?;
//!
//! let handler = registry.get(Channel::Sms).unwrap();
//! ```

pub mod email;
pub mod push;
pub mod sms;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::envelope::{Channel, NotificationEnvelope};
use crate::error::{NotificationError, Result};

pub use email::{EmailHandler, MailTransport, SmtpMailer};
pub use push::PushHandler;
pub use sms::SmsHandler;

/// 渠道投递成功后的回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReceipt {
    /// 外部渠道返回的消息标识，用于追踪投递状态
    pub message_id: String,
}

impl ChannelReceipt {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
        }
    }
}

/// 渠道处理器
///
/// 实现需容忍重复投递：消息在确认前崩溃会被重新消费。
/// 返回的错误通过 [`NotificationError::is_retryable`] 决定是否重试。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle(&self, envelope: &NotificationEnvelope) -> Result<ChannelReceipt>;

    /// 该处理器负责的渠道
    fn channel(&self) -> Channel;
}

/// 处理器注册表
///
/// 启动阶段写入，投递阶段高频读取，使用读写锁保护。
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<Channel, Arc<dyn ChannelHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器
    ///
    /// 处理器声明的渠道必须与注册渠道一致，否则立即报错。
    /// 同一渠道重复注册时新处理器替换旧处理器。
    pub fn register(&self, channel: Channel, handler: Arc<dyn ChannelHandler>) -> Result<()> {
        let reported = handler.channel();
        if reported != channel {
            return Err(NotificationError::HandlerMismatch {
                registered: channel,
                reported,
            });
        }

        debug!(channel = %channel, "注册渠道处理器");
        self.handlers.write().insert(channel, handler);
        Ok(())
    }

    /// 返回 None 表示该渠道没有注册处理器
    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers.read().get(&channel).cloned()
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.handlers.read().contains_key(&channel)
    }

    /// 已注册的渠道，按固定顺序返回
    pub fn registered_channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.handlers.read().keys().copied().collect();
        channels.sort();
        channels
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
