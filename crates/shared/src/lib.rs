//! 共享库
//!
//! 通知服务与其周边工具共用的基础设施代码：配置、错误处理、broker 抽象及其
//! Kafka / 进程内实现、重试退避、死信队列和可观测性初始化。

pub mod broker;
pub mod config;
pub mod dlq;
pub mod error;
pub mod kafka;
pub mod memory;
pub mod observability;
pub mod retry;

pub use broker::{
    ConsumerFactory, ConsumerMessage, DeliveryReceipt, MessageConsumer, MessageProducer,
    ProducerRecord,
};
pub use error::{InfraError, Result};
