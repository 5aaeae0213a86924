//! 通知模板
//!
//! 按 `template_id` 注册的模板优先；没有注册时回退到按通知类型内置的生成器。
//! 注册模板使用 `{{variable}}` 语法，变量缺失视为渲染错误，不会通过重试恢复。
//! 内置生成器对缺失字段使用占位默认值，保证上游数据不完整时仍能发出通知。

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;

use crate::envelope::{NotificationEnvelope, NotificationType};
use crate::error::{NotificationError, Result};

/// 匹配 {{variable_name}} 格式，变量名支持字母、数字、下划线
static VARIABLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("模板变量正则非法"));

/// 一套邮件模板
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl EmailTemplate {
    pub fn new(
        subject: impl Into<String>,
        text: impl Into<String>,
        html: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            text: text.into(),
            html: html.into(),
        }
    }
}

/// 渲染结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// 模板引擎
///
/// 注册在启动阶段完成，渲染在各 worker 中并发进行。
#[derive(Default)]
pub struct TemplateEngine {
    templates: RwLock<HashMap<String, EmailTemplate>>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, template_id: impl Into<String>, template: EmailTemplate) {
        self.templates.write().insert(template_id.into(), template);
    }

    pub fn contains(&self, template_id: &str) -> bool {
        self.templates.read().contains_key(template_id)
    }

    /// 按 ID 取出已注册模板
    pub fn get(&self, template_id: &str) -> Result<EmailTemplate> {
        self.templates
            .read()
            .get(template_id)
            .cloned()
            .ok_or_else(|| NotificationError::TemplateNotFound {
                template_id: template_id.to_string(),
            })
    }

    /// 严格替换模板中的 `{{variable}}`，任何变量缺失都返回渲染错误
    pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
        let missing: Vec<&str> = VARIABLE_REGEX
            .captures_iter(template)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|name| !vars.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(NotificationError::Render(format!(
                "模板变量缺失: {}",
                missing.join(", ")
            )));
        }

        let rendered = VARIABLE_REGEX.replace_all(template, |caps: &regex::Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        });
        Ok(rendered.into_owned())
    }

    /// 渲染一封通知邮件
    pub fn render_envelope(&self, envelope: &NotificationEnvelope) -> Result<RenderedContent> {
        let vars = template_variables(envelope);

        if let Some(template_id) = envelope.template_id.as_deref() {
            if let Ok(template) = self.get(template_id) {
                // html 部分只转义代入的变量，模板自身的标记保持原样
                let html_vars: BTreeMap<String, String> = vars
                    .iter()
                    .map(|(k, v)| (k.clone(), escape_html(v)))
                    .collect();
                return Ok(RenderedContent {
                    subject: Self::render(&template.subject, &vars)?,
                    text: Self::render(&template.text, &vars)?,
                    html: Self::render(&template.html, &html_vars)?,
                });
            }
            debug!(
                template_id,
                notification_type = %envelope.notification_type,
                "模板未注册，使用内置生成器"
            );
        }

        Ok(builtin_content(envelope, &vars))
    }
}

/// 模板可用的变量：负载字段加上信封自身的常用字段
pub fn template_variables(envelope: &NotificationEnvelope) -> BTreeMap<String, String> {
    let mut vars: BTreeMap<String, String> = envelope
        .payload
        .iter()
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect();

    vars.insert("user_id".to_string(), envelope.user_id.clone());
    vars.insert("email".to_string(), envelope.email.clone());
    vars.insert("recipient_name".to_string(), recipient_name(envelope).to_string());
    vars.insert("subject".to_string(), envelope.subject.clone());
    vars.insert(
        "notification_type".to_string(),
        envelope.notification_type.to_string(),
    );
    for (key, value) in [
        ("event_id", &envelope.event_id),
        ("booking_id", &envelope.booking_id),
        ("waitlist_entry_id", &envelope.waitlist_entry_id),
    ] {
        if let Some(value) = value {
            vars.insert(key.to_string(), value.clone());
        }
    }
    vars
}

fn recipient_name(envelope: &NotificationEnvelope) -> &str {
    envelope
        .name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or("there")
}

/// 字符串直接取值，数值等非字符串类型转为 JSON 文本
fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn var<'a>(vars: &'a BTreeMap<String, String>, key: &str, default: &'a str) -> &'a str {
    vars.get(key).map(String::as_str).unwrap_or(default)
}

/// 按通知类型内置的标题和正文
fn builtin_content(
    envelope: &NotificationEnvelope,
    vars: &BTreeMap<String, String>,
) -> RenderedContent {
    let event = var(vars, "event_name", "your event");

    let (default_subject, body) = match envelope.notification_type {
        NotificationType::WaitlistSpotAvailable => (
            format!("A spot is available for {event}"),
            format!(
                "Good news! A spot has opened up for {event}. Claim it before {}.",
                var(vars, "claim_deadline", "it expires")
            ),
        ),
        NotificationType::WaitlistPositionUpdate => (
            format!("Waitlist update for {event}"),
            format!(
                "You are now number {} on the waitlist for {event}.",
                var(vars, "position", "?")
            ),
        ),
        NotificationType::WaitlistSpotExpired => (
            format!("Your waitlist spot for {event} has expired"),
            format!(
                "The spot we held for you at {event} was not claimed in time and has been released."
            ),
        ),
        NotificationType::BookingConfirmed => (
            format!("Booking confirmed: {event}"),
            format!(
                "Your booking for {event} is confirmed. Tickets: {}. Booking reference: {}.",
                var(vars, "ticket_count", "1"),
                var(vars, "booking_id", "n/a")
            ),
        ),
        NotificationType::BookingCancelled => (
            format!("Booking cancelled: {event}"),
            format!(
                "Your booking for {event} has been cancelled. Reason: {}.",
                var(vars, "reason", "not specified")
            ),
        ),
        NotificationType::EventReminder => (
            format!("Reminder: {event}"),
            format!(
                "This is a reminder that {event} starts at {}.",
                var(vars, "starts_at", "the scheduled time")
            ),
        ),
        NotificationType::EventUpdated => (
            format!("{event} has been updated"),
            format!(
                "Details for {event} have changed. {}",
                var(vars, "changes", "Please review the latest event information.")
            ),
        ),
        NotificationType::EventCancelled => (
            format!("{event} has been cancelled"),
            format!(
                "We're sorry, {event} has been cancelled. Reason: {}. Any payment will be refunded.",
                var(vars, "reason", "not specified")
            ),
        ),
    };

    let subject = if envelope.subject.trim().is_empty() {
        default_subject
    } else {
        envelope.subject.clone()
    };
    let greeting = format!("Hi {},", recipient_name(envelope));

    RenderedContent {
        text: format!("{greeting}\n\n{body}\n"),
        html: format!(
            "<html><body><p>{}</p><p>{}</p></body></html>",
            escape_html(&greeting),
            escape_html(&body)
        ),
        subject,
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
