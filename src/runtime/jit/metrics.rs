use std::sync::atomic::{AtomicU64, Ordering};

/// Retracing counters for one dispatcher.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    calls: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    traces: AtomicU64,
    relaxations: AtomicU64,
    failed_traces: AtomicU64,
    consecutive_traces: AtomicU64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.consecutive_traces.store(0, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns how many traces in a row happened without an intervening hit.
    pub fn record_trace(&self, relaxed: bool) -> u64 {
        self.traces.fetch_add(1, Ordering::Relaxed);
        if relaxed {
            self.relaxations.fetch_add(1, Ordering::Relaxed);
        }
        self.consecutive_traces.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A miss served by an existing relaxed entry instead of a new trace.
    pub fn record_relaxation(&self) {
        self.relaxations.fetch_add(1, Ordering::Relaxed);
        self.consecutive_traces.store(0, Ordering::Relaxed);
    }

    pub fn record_failed_trace(&self) {
        self.failed_traces.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        DispatchMetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            traces: self.traces.load(Ordering::Relaxed),
            relaxations: self.relaxations.load(Ordering::Relaxed),
            failed_traces: self.failed_traces.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchMetricsSnapshot {
    pub calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub traces: u64,
    pub relaxations: u64,
    pub failed_traces: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_reset_the_retrace_streak() {
        let metrics = DispatchMetrics::new();
        metrics.record_miss();
        assert_eq!(metrics.record_trace(false), 1);
        metrics.record_miss();
        assert_eq!(metrics.record_trace(true), 2);
        metrics.record_hit();
        metrics.record_miss();
        assert_eq!(metrics.record_trace(false), 1);

        let snap = metrics.snapshot();
        assert_eq!(snap.calls, 4);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.traces, 3);
        assert_eq!(snap.relaxations, 1);
    }
}
