//! 消费端运行指标
//!
//! 所有 worker 共享同一份计数器。计数使用原子操作，
//! 最近一条消息的时间和耗时成对更新，放在锁里保证一致。
//! 每次记录同时写入 Prometheus 指标。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify_shared::observability::metrics as prom;
use parking_lot::Mutex;
use serde::Serialize;

use crate::dispatch::MessageOutcome;

#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    partial: AtomicU64,
    skipped: AtomicU64,
    expired: AtomicU64,
    malformed: AtomicU64,
    deferred: AtomicU64,
    broker_errors: AtomicU64,
    active_workers: AtomicUsize,
    last_message: Mutex<Option<(DateTime<Utc>, Duration)>>,
}

/// 指标快照
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub partially_delivered: u64,
    pub skipped: u64,
    pub expired: u64,
    pub malformed: u64,
    pub deferred: u64,
    pub broker_errors: u64,
    pub active_workers: usize,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一条消息的最终结果，未确认的消息不计入
    pub fn record(&self, outcome: &MessageOutcome, elapsed: Duration) {
        let counter = match outcome {
            MessageOutcome::Sent => &self.succeeded,
            MessageOutcome::Failed => &self.failed,
            MessageOutcome::PartiallyDelivered => &self.partial,
            MessageOutcome::Skipped => &self.skipped,
            MessageOutcome::Expired | MessageOutcome::Exhausted => &self.expired,
            MessageOutcome::Malformed => &self.malformed,
            MessageOutcome::Deferred => &self.deferred,
            MessageOutcome::Interrupted => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
        *self.last_message.lock() = Some((Utc::now(), elapsed));

        prom::record_processed(outcome.as_str(), elapsed);
    }

    pub fn record_broker_error(&self) {
        self.broker_errors.fetch_add(1, Ordering::Relaxed);
        prom::record_broker_error();
    }

    pub fn worker_started(&self) {
        let active = self.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
        prom::set_active_workers(active);
    }

    pub fn worker_stopped(&self) {
        let previous = self
            .active_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prom::set_active_workers(previous.saturating_sub(1));
    }

    /// 被强制中止的 worker 来不及自行注销
    pub fn reset_active_workers(&self) {
        self.active_workers.store(0, Ordering::SeqCst);
        prom::set_active_workers(0);
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last = *self.last_message.lock();
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            partially_delivered: self.partial.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            broker_errors: self.broker_errors.load(Ordering::Relaxed),
            active_workers: self.active_workers(),
            last_message_at: last.map(|(at, _)| at),
            last_latency_ms: last.map(|(_, d)| d.as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_outcomes() {
        let metrics = ConsumerMetrics::new();
        metrics.record(&MessageOutcome::Sent, Duration::from_millis(5));
        metrics.record(&MessageOutcome::Failed, Duration::from_millis(7));
        metrics.record(&MessageOutcome::Expired, Duration::from_millis(1));
        metrics.record(&MessageOutcome::Exhausted, Duration::from_millis(1));
        metrics.record(&MessageOutcome::Malformed, Duration::from_millis(1));
        metrics.record(&MessageOutcome::Interrupted, Duration::from_millis(1));
        metrics.record(&MessageOutcome::Deferred, Duration::from_millis(3));
        metrics.record(&MessageOutcome::Skipped, Duration::from_millis(42));

        let snap = metrics.snapshot();
        assert_eq!(snap.processed, 7, "中断的消息不计入");
        assert_eq!(snap.deferred, 1);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.expired, 2);
        assert_eq!(snap.malformed, 1);
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.last_latency_ms, Some(42));
        assert!(snap.last_message_at.is_some());
    }

    #[test]
    fn test_active_workers_never_underflow() {
        let metrics = ConsumerMetrics::new();
        metrics.worker_started();
        metrics.worker_started();
        metrics.worker_stopped();
        assert_eq!(metrics.active_workers(), 1);

        metrics.worker_stopped();
        metrics.worker_stopped();
        assert_eq!(metrics.active_workers(), 0);
    }

    #[test]
    fn test_broker_errors_accumulate() {
        let metrics = ConsumerMetrics::new();
        metrics.record_broker_error();
        metrics.record_broker_error();
        assert_eq!(metrics.snapshot().broker_errors, 2);
    }
}
