//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Kafka 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// 逗号分隔的 broker 地址列表
    pub brokers: String,
    /// 通知主 topic
    pub topic: String,
    /// 死信 topic，为空时不投递死信
    pub dead_letter_topic: Option<String>,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    /// 单条消息等待 broker 确认的上限
    pub send_timeout_ms: u64,
    pub session_timeout_ms: u64,
    /// 生产者身份标识，写入消息头 `producer`
    pub producer_id: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "ticketing.notifications".to_string(),
            dead_letter_topic: Some("ticketing.notifications.dlq".to_string()),
            consumer_group: "notification-service".to_string(),
            auto_offset_reset: "earliest".to_string(),
            send_timeout_ms: 5000,
            session_timeout_ms: 10000,
            producer_id: "notification-service".to_string(),
        }
    }
}

impl KafkaConfig {
    /// 拆分 broker 列表，忽略空白项
    pub fn broker_list(&self) -> Vec<String> {
        self.brokers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// 空字符串视为未配置死信 topic
    pub fn dead_letter_topic(&self) -> Option<&str> {
        self.dead_letter_topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// 消费者工作池配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// 单个渠道的最大重试次数（不含首次投递）
    pub max_retries: u32,
    /// 退避基准时长，第 k 次重试前等待 base * 2^k
    pub base_delay_ms: u64,
    /// 单次渠道投递的超时上限
    pub processing_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    /// broker 拉取出错后的暂停时长
    pub poll_error_backoff_ms: u64,
    /// 停机时等待在途消息处理完成的宽限期
    pub shutdown_grace_ms: u64,
    /// 未到计划时间的消息在 worker 中最多停留的时长，超出后写回 topic 末尾
    pub schedule_hold_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            max_retries: 3,
            base_delay_ms: 1000,
            processing_timeout_ms: 30_000,
            poll_timeout_ms: 1000,
            poll_error_backoff_ms: 5000,
            shutdown_grace_ms: 30_000,
            schedule_hold_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn poll_error_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_error_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn schedule_hold(&self) -> Duration {
        Duration::from_millis(self.schedule_hold_ms)
    }
}

/// 渠道开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub email_enabled: bool,
    pub sms_enabled: bool,
    pub push_enabled: bool,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            email_enabled: true,
            sms_enabled: false,
            push_enabled: false,
        }
    }
}

/// SMTP 中继配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    pub from_name: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            username: String::new(),
            password: String::new(),
            from_address: "noreply@tickets.example.com".to_string(),
            from_name: "Ticketing".to_string(),
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 是否输出 JSON 结构化日志
    pub json_logs: bool,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
            metrics_port: 9090,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub kafka: KafkaConfig,
    pub worker: WorkerConfig,
    pub channels: ChannelsConfig,
    pub smtp: SmtpConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml
    /// 2. config/{environment}.toml
    /// 3. config/{service_name}.toml
    /// 4. 环境变量（NOTIFY_ 前缀，双下划线分隔层级，如 NOTIFY_KAFKA__BROKERS -> kafka.brokers）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        // .env 不存在属于正常情况
        let _ = dotenvy::dotenv();

        let env = std::env::var("NOTIFY_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("NOTIFY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 校验启动所需的必填项，返回全部缺失项
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.kafka.broker_list().is_empty() {
            problems.push("kafka.brokers 不能为空".to_string());
        }
        if self.kafka.topic.trim().is_empty() {
            problems.push("kafka.topic 不能为空".to_string());
        }
        if self.kafka.consumer_group.trim().is_empty() {
            problems.push("kafka.consumer_group 不能为空".to_string());
        }
        if self.worker.worker_count == 0 {
            problems.push("worker.worker_count 必须大于 0".to_string());
        }
        if self.worker.schedule_hold_ms == 0 {
            problems.push("worker.schedule_hold_ms 必须大于 0".to_string());
        }
        if self.channels.email_enabled {
            if self.smtp.host.trim().is_empty() {
                problems.push("smtp.host 不能为空".to_string());
            }
            if self.smtp.from_address.trim().is_empty() {
                problems.push("smtp.from_address 不能为空".to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.worker.worker_count, 3);
        assert_eq!(config.kafka.topic, "ticketing.notifications");
        assert!(config.channels.email_enabled);
        assert!(!config.channels.sms_enabled);
    }

    #[test]
    fn test_broker_list_split() {
        let kafka = KafkaConfig {
            brokers: "k1:9092, k2:9092,,k3:9092 ".to_string(),
            ..Default::default()
        };
        assert_eq!(kafka.broker_list(), vec!["k1:9092", "k2:9092", "k3:9092"]);
    }

    #[test]
    fn test_blank_dead_letter_topic_is_disabled() {
        let kafka = KafkaConfig {
            dead_letter_topic: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(kafka.dead_letter_topic(), None);
        assert_eq!(
            KafkaConfig::default().dead_letter_topic(),
            Some("ticketing.notifications.dlq")
        );
    }

    #[test]
    fn test_validate_default_is_ok() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let config = AppConfig {
            kafka: KafkaConfig {
                brokers: " ".to_string(),
                topic: String::new(),
                ..Default::default()
            },
            worker: WorkerConfig {
                worker_count: 0,
                schedule_hold_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        let problems = config.validate().unwrap_err();
        assert_eq!(problems.len(), 4);
        assert!(problems.iter().any(|p| p.contains("kafka.brokers")));
        assert!(problems.iter().any(|p| p.contains("kafka.topic")));
        assert!(problems.iter().any(|p| p.contains("worker.worker_count")));
        assert!(problems.iter().any(|p| p.contains("worker.schedule_hold_ms")));
    }

    #[test]
    fn test_smtp_required_only_when_email_enabled() {
        let mut config = AppConfig {
            smtp: SmtpConfig {
                host: String::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.channels.email_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_durations() {
        let worker = WorkerConfig {
            base_delay_ms: 250,
            processing_timeout_ms: 1500,
            ..Default::default()
        };
        assert_eq!(worker.base_delay(), Duration::from_millis(250));
        assert_eq!(worker.processing_timeout(), Duration::from_millis(1500));
        assert_eq!(worker.schedule_hold(), Duration::from_secs(1));
    }
}
