// Trace cache
pub mod function_cache;
pub mod metadata;

use std::sync::Arc;

pub use function_cache::{CacheStats, FunctionCache};
pub use metadata::CacheMetadata;

use super::concrete::ConcreteFunction;
use super::specialization::SignatureKey;

/// Cache entry for a traced function
#[derive(Debug, Clone)]
pub struct CachedFunction {
    pub key: SignatureKey,
    pub function: Arc<ConcreteFunction>,
    pub metadata: Arc<CacheMetadata>,
}

impl CachedFunction {
    pub fn new(key: SignatureKey, function: Arc<ConcreteFunction>, metadata: CacheMetadata) -> Self {
        Self {
            key,
            function,
            metadata: Arc::new(metadata),
        }
    }
}
