//! 重试策略
//!
//! 提供指数退避计算和可被停机信号打断的退避等待。
//! 是否重试由调用方依据错误类型决定，这里只负责"等多久"和"还能不能再试"。

use std::time::Duration;

use tokio::sync::watch;

use crate::config::WorkerConfig;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// 重试策略配置
///
/// 第 k 次重试前等待 `base_delay * 2^k`：首次失败等 1 秒，第 2 次等 2 秒，
/// 第 3 次等 4 秒。退避不设上限，重试次数由 `max_retries` 约束。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 首次重试前的等待时间
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.max_retries, config.base_delay())
    }

    /// 计算第 N 次重试前的等待时间（attempt 从 0 开始）
    ///
    /// 逐次翻倍，溢出时饱和到 `Duration::MAX`。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        (0..attempt)
            .try_fold(self.base_delay, |delay, _| delay.checked_mul(2))
            .unwrap_or(Duration::MAX)
    }

    /// 沿用本策略的退避基准，替换重试次数
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self { max_retries, ..self }
    }

    /// 首次执行加全部重试的总尝试次数
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

// ---------------------------------------------------------------------------
// 可取消的等待
// ---------------------------------------------------------------------------

/// 等待 `delay`，期间收到停机信号则提前返回 `false`
///
/// 返回 `true` 表示完整等待结束，调用方可以继续重试。
/// 停机信号的发送端已被丢弃时视为不会再有停机信号，正常等满。
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                match changed {
                    Ok(()) if *shutdown.borrow() => return false,
                    Ok(()) => continue,
                    Err(_) => {
                        (&mut sleep).await;
                        return true;
                    }
                }
            }
            _ = &mut sleep => return true,
        }
    }
}
