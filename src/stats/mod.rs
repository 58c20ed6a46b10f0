//! Run statistics: counters and a retry histogram, in the same plain
//! snapshot-struct style as `fusillade::batch::BatchStatus`, generalized
//! from one status enum's worth of counters to the crawler's broader set
//! (requests finished/failed/skipped, retry attempts, error kinds seen).
//! See spec §4.6's "Statistics" concern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A point-in-time snapshot of [`Statistics`], safe to serialize and log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub requests_finished: u64,
    pub requests_failed: u64,
    pub requests_skipped: u64,
    pub requests_retried: u64,
    /// retry attempt number -> count of requests that reached that attempt,
    /// e.g. `{1: 25, 2: 16, 3: 9}`.
    pub retry_histogram: HashMap<u32, u64>,
    /// error variant name (`CrawlerError` discriminant) -> occurrence count.
    pub errors_by_kind: HashMap<String, u64>,
    pub crawler_runtime: Duration,
}

/// Live, thread-safe counters accumulated over the course of a run.
pub struct Statistics {
    started_at: DateTime<Utc>,
    requests_finished: AtomicU64,
    requests_failed: AtomicU64,
    requests_skipped: AtomicU64,
    requests_retried: AtomicU64,
    retry_histogram: Mutex<HashMap<u32, u64>>,
    errors_by_kind: Mutex<HashMap<String, u64>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            requests_finished: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_skipped: AtomicU64::new(0),
            requests_retried: AtomicU64::new(0),
            retry_histogram: Mutex::new(HashMap::new()),
            errors_by_kind: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_finished(&self) {
        self.requests_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self, error_kind: &str) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        *self.errors_by_kind.lock().entry(error_kind.to_string()).or_default() += 1;
    }

    pub fn record_skipped(&self) {
        self.requests_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a request is being retried for the `attempt`-th time
    /// (1-indexed: the first retry is attempt 1).
    pub fn record_retry(&self, attempt: u32, error_kind: &str) {
        self.requests_retried.fetch_add(1, Ordering::Relaxed);
        *self.retry_histogram.lock().entry(attempt).or_default() += 1;
        *self.errors_by_kind.lock().entry(error_kind.to_string()).or_default() += 1;
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            requests_finished: self.requests_finished.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_skipped: self.requests_skipped.load(Ordering::Relaxed),
            requests_retried: self.requests_retried.load(Ordering::Relaxed),
            retry_histogram: self.retry_histogram.lock().clone(),
            errors_by_kind: self.errors_by_kind.lock().clone(),
            crawler_runtime: (Utc::now() - self.started_at)
                .to_std()
                .unwrap_or(Duration::ZERO),
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_histogram_matches_seed_scenario_shape() {
        let stats = Statistics::new();
        for attempt in [1u32, 2, 3] {
            let count = match attempt {
                1 => 25,
                2 => 16,
                _ => 9,
            };
            for _ in 0..count {
                stats.record_retry(attempt, "HttpStatusCode");
            }
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.retry_histogram.get(&1), Some(&25));
        assert_eq!(snapshot.retry_histogram.get(&2), Some(&16));
        assert_eq!(snapshot.retry_histogram.get(&3), Some(&9));
        assert_eq!(snapshot.requests_retried, 50);
    }
}
