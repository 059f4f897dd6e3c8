use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use super::{CacheMetadata, CachedFunction, SignatureKey};
use crate::runtime::jit::concrete::ConcreteFunction;

#[derive(Debug, Default)]
struct CacheInner {
    index: AHashMap<SignatureKey, usize>,
    entries: Vec<CachedFunction>,
}

/// Map from signature key to traced function. Entries live as long as the cache.
#[derive(Debug, Default, Clone)]
pub struct FunctionCache {
    inner: Arc<RwLock<CacheInner>>,
}

impl FunctionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached function
    pub fn get(&self, key: &SignatureKey) -> Option<CachedFunction> {
        let inner = self.inner.read();
        inner
            .index
            .get(key)
            .and_then(|&idx| inner.entries.get(idx))
            .cloned()
    }

    /// Store a traced function. If an equal key is already present the
    /// existing entry is kept and returned instead.
    pub fn insert(
        &self,
        key: SignatureKey,
        function: Arc<ConcreteFunction>,
        trace_time: Duration,
    ) -> CachedFunction {
        let mut inner = self.inner.write();
        if let Some(&idx) = inner.index.get(&key) {
            return inner.entries[idx].clone();
        }
        let entry = CachedFunction::new(key.clone(), function, CacheMetadata::new(trace_time));
        let idx = inner.entries.len();
        inner.entries.push(entry.clone());
        inner.index.insert(key, idx);
        entry
    }

    /// Traced functions in insertion order.
    pub fn list_entries(&self) -> Vec<Arc<ConcreteFunction>> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|e| Arc::clone(&e.function))
            .collect()
    }

    pub fn entries(&self) -> Vec<CachedFunction> {
        self.inner.read().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            total_functions: inner.entries.len(),
            total_calls: inner.entries.iter().map(|e| e.metadata.call_count()).sum(),
            total_trace_time: inner.entries.iter().map(|e| e.metadata.trace_time).sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total_functions: usize,
    pub total_calls: u64,
    pub total_trace_time: Duration,
}
