//! Coordination counters and periodic structured log emission.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::protocol_constants::COUNTER_LOG_INTERVAL;

/// Point-in-time view of the counters, also served by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub reconnect_samples: u64,
    pub reconnect_breaches: u64,
    pub conflict_errors: u64,
    pub mutation_lock_acquire_failures: u64,
    pub disconnect_cleanup_scheduled: u64,
    pub disconnect_cleanup_executed: u64,
}

/// Process-wide coordination counters.
///
/// Individual breaches and lock transport failures are logged as they
/// happen; the aggregate is logged every [`COUNTER_LOG_INTERVAL`] recorded
/// events so idle pods stay quiet.
#[derive(Default)]
pub struct CoordMetrics {
    reconnect_samples: AtomicU64,
    reconnect_breaches: AtomicU64,
    conflict_errors: AtomicU64,
    mutation_lock_acquire_failures: AtomicU64,
    disconnect_cleanup_scheduled: AtomicU64,
    disconnect_cleanup_executed: AtomicU64,
    events_recorded: AtomicU64,
}

impl CoordMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one reconnect latency sample against the SLO.
    pub fn record_reconnect(&self, latency_ms: u64, slo_ms: u64) {
        self.reconnect_samples.fetch_add(1, Ordering::Relaxed);
        if latency_ms > slo_ms {
            self.reconnect_breaches.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "[Metrics] Reconnect SLO breach: latency_ms={} slo_ms={}",
                latency_ms,
                slo_ms
            );
        }
        self.tick();
    }

    pub fn record_conflict(&self) {
        self.conflict_errors.fetch_add(1, Ordering::Relaxed);
        self.tick();
    }

    /// A lock acquire failed for a transport reason (not contention).
    pub fn record_lock_failure(&self, detail: &str) {
        self.mutation_lock_acquire_failures
            .fetch_add(1, Ordering::Relaxed);
        log::error!("[Metrics] Mutation lock transport failure: {}", detail);
        self.tick();
    }

    pub fn record_cleanup_scheduled(&self) {
        self.disconnect_cleanup_scheduled
            .fetch_add(1, Ordering::Relaxed);
        self.tick();
    }

    pub fn record_cleanup_executed(&self) {
        self.disconnect_cleanup_executed
            .fetch_add(1, Ordering::Relaxed);
        self.tick();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reconnect_samples: self.reconnect_samples.load(Ordering::Relaxed),
            reconnect_breaches: self.reconnect_breaches.load(Ordering::Relaxed),
            conflict_errors: self.conflict_errors.load(Ordering::Relaxed),
            mutation_lock_acquire_failures: self
                .mutation_lock_acquire_failures
                .load(Ordering::Relaxed),
            disconnect_cleanup_scheduled: self
                .disconnect_cleanup_scheduled
                .load(Ordering::Relaxed),
            disconnect_cleanup_executed: self.disconnect_cleanup_executed.load(Ordering::Relaxed),
        }
    }

    fn tick(&self) {
        let n = self.events_recorded.fetch_add(1, Ordering::Relaxed) + 1;
        if n % COUNTER_LOG_INTERVAL == 0 {
            let s = self.snapshot();
            log::info!(
                "[Metrics] reconnect_samples={} reconnect_breaches={} conflict_errors={} \
                 mutation_lock_acquire_failures={} disconnect_cleanup_scheduled={} \
                 disconnect_cleanup_executed={}",
                s.reconnect_samples,
                s.reconnect_breaches,
                s.conflict_errors,
                s.mutation_lock_acquire_failures,
                s.disconnect_cleanup_scheduled,
                s.disconnect_cleanup_executed
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_below_slo_is_not_a_breach() {
        let metrics = CoordMetrics::new();
        metrics.record_reconnect(2_000, 5_000);
        let s = metrics.snapshot();
        assert_eq!(s.reconnect_samples, 1);
        assert_eq!(s.reconnect_breaches, 0);
    }

    #[test]
    fn reconnect_above_slo_is_a_breach() {
        let metrics = CoordMetrics::new();
        metrics.record_reconnect(7_500, 5_000);
        let s = metrics.snapshot();
        assert_eq!(s.reconnect_samples, 1);
        assert_eq!(s.reconnect_breaches, 1);
    }

    #[test]
    fn counters_accumulate_independently() {
        let metrics = CoordMetrics::new();
        metrics.record_conflict();
        metrics.record_conflict();
        metrics.record_lock_failure("connection refused");
        metrics.record_cleanup_scheduled();
        metrics.record_cleanup_executed();

        let s = metrics.snapshot();
        assert_eq!(s.conflict_errors, 2);
        assert_eq!(s.mutation_lock_acquire_failures, 1);
        assert_eq!(s.disconnect_cleanup_scheduled, 1);
        assert_eq!(s.disconnect_cleanup_executed, 1);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let json = serde_json::to_value(CoordMetrics::new().snapshot()).unwrap();
        assert!(json.get("reconnectSamples").is_some());
        assert!(json.get("mutationLockAcquireFailures").is_some());
    }
}
