//! 统一错误处理模块
//!
//! 定义基础设施层（broker、配置、序列化）共享的错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 基础设施错误类型
#[derive(Debug, Error)]
pub enum InfraError {
    // ==================== Broker 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("broker 操作超时: {operation}")]
    Timeout { operation: String },

    #[error("消费者已关闭")]
    ConsumerClosed,

    // ==================== 数据错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(String),

    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("配置缺失: {0}")]
    MissingConfig(String),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, InfraError>;

impl InfraError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Timeout { .. } => "BROKER_TIMEOUT",
            Self::ConsumerClosed => "CONSUMER_CLOSED",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::MissingConfig(_) => "MISSING_CONFIG",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有传输层故障可以通过重试恢复，数据和配置问题重试也不会成功。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Kafka(_) | Self::Timeout { .. })
    }
}
