//! 通知服务错误类型
//!
//! 按照能否通过重试恢复来划分错误：传输层故障可重试，
//! 数据、模板和地址问题重试也不会成功，直接记为失败。

use notify_shared::error::InfraError;
use thiserror::Error;

use crate::envelope::{Channel, NotificationStatus};

#[derive(Debug, Error)]
pub enum NotificationError {
    // ==================== 构建与校验 ====================
    #[error("通知校验失败: {0}")]
    Validation(String),

    #[error("非法状态流转: {from} -> {to}")]
    InvalidTransition {
        from: NotificationStatus,
        to: NotificationStatus,
    },

    #[error("只有 PENDING 状态的通知可以发布，当前状态: {0}")]
    NotPublishable(NotificationStatus),

    #[error("通知序列化失败: {0}")]
    Serialization(String),

    // ==================== 投递 ====================
    #[error("渠道传输失败: 渠道={channel}, 原因={reason}")]
    Transport { channel: Channel, reason: String },

    #[error("渠道投递超时: 渠道={channel}, 超时={timeout_ms}ms")]
    Timeout { channel: Channel, timeout_ms: u64 },

    #[error("收件地址无效: {0}")]
    InvalidAddress(String),

    #[error("模板渲染失败: {0}")]
    Render(String),

    #[error("通知模板未找到: {template_id}")]
    TemplateNotFound { template_id: String },

    // ==================== 生命周期 ====================
    #[error("处理器渠道不匹配: 注册为 {registered}, 处理器声明为 {reported}")]
    HandlerMismatch {
        registered: Channel,
        reported: Channel,
    },

    #[error("服务已在运行")]
    AlreadyRunning,

    #[error(transparent)]
    Infra(#[from] InfraError),
}

pub type Result<T> = std::result::Result<T, NotificationError>;

impl NotificationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::NotPublishable(_) => "NOT_PUBLISHABLE",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Timeout { .. } => "DELIVERY_TIMEOUT",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::Render(_) => "RENDER_ERROR",
            Self::TemplateNotFound { .. } => "TEMPLATE_NOT_FOUND",
            Self::HandlerMismatch { .. } => "HANDLER_MISMATCH",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::Infra(e) => e.code(),
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Infra(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
