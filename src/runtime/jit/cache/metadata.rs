use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metadata for a traced concrete function
#[derive(Debug)]
pub struct CacheMetadata {
    pub created_at: Instant,
    pub trace_time: Duration,
    call_count: AtomicU64,
}

impl CacheMetadata {
    pub fn new(trace_time: Duration) -> Self {
        Self {
            created_at: Instant::now(),
            trace_time,
            call_count: AtomicU64::new(0),
        }
    }

    pub fn record_call(&self) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }
}

impl Default for CacheMetadata {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}
