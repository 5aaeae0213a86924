//! 邮件渠道
//!
//! 渲染标题和正文后构建 multipart/alternative 邮件（纯文本 + HTML），
//! 经认证的 TLS SMTP 中继发出。传输层错误可重试；
//! 地址和模板问题重试也不会成功，直接失败。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use notify_shared::config::SmtpConfig;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{ChannelHandler, ChannelReceipt};
use crate::envelope::{Channel, NotificationEnvelope};
use crate::error::{NotificationError, Result};
use crate::templates::TemplateEngine;

/// SMTP 会话超时
const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// 邮件出口
///
/// 与具体 SMTP 客户端解耦，测试中可替换为记录型实现。
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: Message) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SmtpMailer
// ---------------------------------------------------------------------------

/// 基于 lettre 的 SMTP 中继客户端
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpMailer {
    /// 建立 TLS 中继配置，连接在首次发送时建立
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| NotificationError::Transport {
                channel: Channel::Email,
                reason: format!("创建 SMTP 中继失败: {e}"),
            })?
            .port(config.port)
            .timeout(Some(SMTP_TIMEOUT));

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        info!(host = %config.host, port = config.port, "SMTP 中继已配置");
        Ok(Self {
            transport: builder.build(),
            host: config.host.clone(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, message: Message) -> Result<()> {
        let response = self.transport.send(message).await.map_err(|e| {
            error!(host = %self.host, error = %e, "SMTP 发送失败");
            NotificationError::Transport {
                channel: Channel::Email,
                reason: e.to_string(),
            }
        })?;

        debug!(
            host = %self.host,
            code = %response.code(),
            "SMTP 中继已接收邮件"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EmailHandler
// ---------------------------------------------------------------------------

pub struct EmailHandler {
    templates: Arc<TemplateEngine>,
    transport: Arc<dyn MailTransport>,
    from: Mailbox,
}

impl EmailHandler {
    pub fn new(
        templates: Arc<TemplateEngine>,
        transport: Arc<dyn MailTransport>,
        from_name: &str,
        from_address: &str,
    ) -> Result<Self> {
        let address: Address = from_address.parse().map_err(|e| {
            NotificationError::InvalidAddress(format!("发件地址 {from_address} 无效: {e}"))
        })?;
        let name = Some(from_name.to_string()).filter(|n| !n.trim().is_empty());

        Ok(Self {
            templates,
            transport,
            from: Mailbox::new(name, address),
        })
    }

    pub fn from_config(templates: Arc<TemplateEngine>, config: &SmtpConfig) -> Result<Self> {
        let mailer = SmtpMailer::from_config(config)?;
        Self::new(
            templates,
            Arc::new(mailer),
            &config.from_name,
            &config.from_address,
        )
    }

    /// 构建待发送的邮件，返回邮件及其 Message-ID
    pub fn build_message(&self, envelope: &NotificationEnvelope) -> Result<(Message, String)> {
        let address: Address = envelope.email.parse().map_err(|e| {
            NotificationError::InvalidAddress(format!("收件地址 {} 无效: {e}", envelope.email))
        })?;
        let to = Mailbox::new(envelope.name.clone(), address);

        let content = self.templates.render_envelope(envelope)?;
        let message_id = format!("<{}@{}>", Uuid::now_v7(), self.from.email.domain());

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(content.subject)
            .date_now()
            .message_id(Some(message_id.clone()))
            .multipart(MultiPart::alternative_plain_html(content.text, content.html))
            .map_err(|e| NotificationError::Render(format!("构建邮件失败: {e}")))?;

        Ok((message, message_id))
    }
}

#[async_trait]
impl ChannelHandler for EmailHandler {
    async fn handle(&self, envelope: &NotificationEnvelope) -> Result<ChannelReceipt> {
        let (message, message_id) = self.build_message(envelope)?;

        self.transport.send(message).await?;

        info!(
            channel = "EMAIL",
            notification_id = %envelope.id,
            user_id = %envelope.user_id,
            message_id = %message_id,
            "邮件已发送"
        );
        Ok(ChannelReceipt::new(message_id))
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }
}
