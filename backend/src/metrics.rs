//! Counters for the oracle and keeper loops, served on `/metrics`.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    /// Randomness requests seen by the listener or the catch-up scan.
    pub requests_received: AtomicU64,
    pub requests_fulfilled: AtomicU64,
    /// Requests given up on after exhausting their retries.
    pub requests_failed: AtomicU64,
    /// Failed tries put back on the queue.
    pub requests_requeued: AtomicU64,
    /// Requests dropped as already fulfilled or not ours to fulfill.
    pub requests_skipped: AtomicU64,
    pub fulfillment_latency_sum_ms: AtomicU64,
    pub fulfillment_count: AtomicU64,

    pub keeper_polls: AtomicU64,
    pub upkeeps_performed: AtomicU64,
    pub upkeeps_failed: AtomicU64,
    /// Chain time of the last successful keeper poll; 0 before the first.
    pub last_poll_unix: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful fulfillment with its latency.
    pub fn record_fulfillment(&self, latency_ms: u64) {
        self.requests_fulfilled.fetch_add(1, Ordering::Relaxed);
        self.fulfillment_latency_sum_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        self.fulfillment_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.requests_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.requests_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll(&self, chain_time: i64) {
        self.keeper_polls.fetch_add(1, Ordering::Relaxed);
        self.last_poll_unix.store(chain_time, Ordering::Relaxed);
    }

    pub fn record_upkeep(&self) {
        self.upkeeps_performed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upkeep_failure(&self) {
        self.upkeeps_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Average fulfillment latency in milliseconds, or 0 if none.
    pub fn avg_latency_ms(&self) -> u64 {
        let count = self.fulfillment_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.fulfillment_latency_sum_ms.load(Ordering::Relaxed) / count
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests_received": self.requests_received.load(Ordering::Relaxed),
            "requests_fulfilled": self.requests_fulfilled.load(Ordering::Relaxed),
            "requests_failed": self.requests_failed.load(Ordering::Relaxed),
            "requests_requeued": self.requests_requeued.load(Ordering::Relaxed),
            "requests_skipped": self.requests_skipped.load(Ordering::Relaxed),
            "avg_fulfillment_latency_ms": self.avg_latency_ms(),
            "fulfillment_count": self.fulfillment_count.load(Ordering::Relaxed),
            "keeper_polls": self.keeper_polls.load(Ordering::Relaxed),
            "upkeeps_performed": self.upkeeps_performed.load(Ordering::Relaxed),
            "upkeeps_failed": self.upkeeps_failed.load(Ordering::Relaxed),
            "last_poll_unix": self.last_poll_unix.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_latency_handles_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.avg_latency_ms(), 0);

        metrics.record_fulfillment(100);
        metrics.record_fulfillment(300);
        assert_eq!(metrics.avg_latency_ms(), 200);
    }

    #[test]
    fn json_reports_keeper_counters() {
        let metrics = Metrics::new();
        metrics.record_poll(1_700_000_000);
        metrics.record_poll(1_700_000_005);
        metrics.record_upkeep();
        metrics.record_upkeep_failure();
        metrics.record_skip();
        metrics.record_requeue();

        let json = metrics.to_json();
        assert_eq!(json["keeper_polls"], 2);
        assert_eq!(json["last_poll_unix"], 1_700_000_005i64);
        assert_eq!(json["upkeeps_performed"], 1);
        assert_eq!(json["upkeeps_failed"], 1);
        assert_eq!(json["requests_skipped"], 1);
        assert_eq!(json["requests_requeued"], 1);
        assert_eq!(json["requests_received"], 0);
    }
}
