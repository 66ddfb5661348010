//! Engine metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Counters shared by every engine component.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub dispatches: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
    pub acks: AtomicU64,
    pub requeues: AtomicU64,
    pub dead_letters: AtomicU64,
    pub discards: AtomicU64,
    pub cron_fires: AtomicU64,
    /// Occurrences skipped by missed-window coalescing.
    pub cron_missed: AtomicU64,

    start_time: parking_lot::RwLock<Option<Instant>>,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub dispatches: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub acks: u64,
    pub requeues: u64,
    pub dead_letters: u64,
    pub discards: u64,
    pub cron_fires: u64,
    pub cron_missed: u64,
    pub uptime_secs: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .read()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.requeues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cron_fire(&self, missed: u64) {
        self.cron_fires.fetch_add(1, Ordering::Relaxed);
        self.cron_missed.fetch_add(missed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            requeues: self.requeues.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            cron_fires: self.cron_fires.load(Ordering::Relaxed),
            cron_missed: self.cron_missed.load(Ordering::Relaxed),
            uptime_secs: self.uptime_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = EngineMetrics::new();
        metrics.record_dispatch();
        metrics.record_dispatch();
        metrics.record_success();
        metrics.record_timeout();
        metrics.record_cron_fire(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dispatches, 2);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.cron_fires, 1);
        assert_eq!(snapshot.cron_missed, 2);
        assert_eq!(snapshot.uptime_secs, 0);
    }
}
