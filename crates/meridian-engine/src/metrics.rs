//! # Stage Metrics
//!
//! In-process latency and error aggregates, one per pipeline stage.
//! Each stage keeps running count/sum/min/max plus a bounded window of
//! recent samples (at most 1000), all under a per-metric lock.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Bound on the recent-samples window per stage.
const MAX_RECENT_SAMPLES: usize = 1_000;

#[derive(Debug, Default)]
struct StageInner {
    count: u64,
    errors: u64,
    sum_ms: u64,
    min_ms: Option<u64>,
    max_ms: u64,
    recent_ms: VecDeque<u64>,
}

/// Latency/error aggregate for one stage.
#[derive(Debug, Default)]
pub struct StageMetrics {
    inner: Mutex<StageInner>,
}

/// Point-in-time view of one stage's aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSnapshot {
    pub count: u64,
    pub errors: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
    pub recent_samples: usize,
}

impl StageMetrics {
    /// Records one successful pass through the stage.
    pub fn record(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.count += 1;
        inner.sum_ms += ms;
        inner.min_ms = Some(inner.min_ms.map_or(ms, |min| min.min(ms)));
        inner.max_ms = inner.max_ms.max(ms);
        inner.recent_ms.push_back(ms);
        while inner.recent_ms.len() > MAX_RECENT_SAMPLES {
            inner.recent_ms.pop_front();
        }
    }

    /// Records one failed pass.
    pub fn record_error(&self) {
        self.inner.lock().expect("metrics lock poisoned").errors += 1;
    }

    /// Snapshot of the aggregate.
    pub fn snapshot(&self) -> StageSnapshot {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        StageSnapshot {
            count: inner.count,
            errors: inner.errors,
            min_ms: inner.min_ms.unwrap_or(0),
            max_ms: inner.max_ms,
            avg_ms: if inner.count == 0 { 0 } else { inner.sum_ms / inner.count },
            recent_samples: inner.recent_ms.len(),
        }
    }
}

/// All stage metrics for one engine instance.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    pub preparation: StageMetrics,
    pub compute: StageMetrics,
    pub commit: StageMetrics,
    pub webhook: StageMetrics,
    pub total: StageMetrics,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        MetricsRegistry::default()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_updates_aggregates() {
        let metrics = StageMetrics::default();
        metrics.record(Duration::from_millis(10));
        metrics.record(Duration::from_millis(30));
        metrics.record_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.min_ms, 10);
        assert_eq!(snapshot.max_ms, 30);
        assert_eq!(snapshot.avg_ms, 20);
        assert_eq!(snapshot.recent_samples, 2);
    }

    #[test]
    fn test_recent_window_is_bounded() {
        let metrics = StageMetrics::default();
        for _ in 0..1_500 {
            metrics.record(Duration::from_millis(1));
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.count, 1_500);
        assert_eq!(snapshot.recent_samples, 1_000);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = StageMetrics::default().snapshot();
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.min_ms, 0);
        assert_eq!(snapshot.avg_ms, 0);
    }
}
