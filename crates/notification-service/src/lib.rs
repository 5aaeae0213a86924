//! 通知投递服务
//!
//! 将"需要通知用户某件事"与"通过某个渠道真正送达"解耦：
//! 业务方构建信封交给发布端写入 Kafka，消费者工作池拉取后按渠道投递、
//! 失败退避重试，处理完毕才确认位点。
//!
//! ## 模块
//!
//! - [`envelope`] / [`builder`]：通知信封、状态机与构建器
//! - [`publisher`]：按接收者分区写入 broker
//! - [`handler`]：渠道处理器与注册表（邮件、短信、推送）
//! - [`dispatch`] / [`consumer`]：单条消息的投递重试与工作池
//! - [`service`]：生命周期编排、健康检查与指标
//! - [`ops`]：运维 HTTP 端点

pub mod builder;
pub mod consumer;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod ops;
pub mod publisher;
pub mod service;
pub mod templates;

pub use builder::{NotificationBuilder, Recipient};
pub use envelope::{Channel, NotificationEnvelope, NotificationStatus, NotificationType, Priority};
pub use error::{NotificationError, Result};
pub use service::NotificationService;
