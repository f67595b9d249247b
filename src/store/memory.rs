use super::{AtomicStateStore, StateStore};
use crate::error::StoreError;
use crate::token_bucket::BucketState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Process-local store. Clones share the same map, but nothing is shared
/// across processes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    buckets: Arc<RwLock<HashMap<String, BucketState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with recorded state
    pub async fn len(&self) -> usize {
        self.buckets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_state(&self, key: &str) -> Result<BucketState, StoreError> {
        let buckets = self.buckets.read().await;
        Ok(buckets.get(key).copied().unwrap_or(BucketState::NEVER_SEEN))
    }

    async fn set_state(&self, key: &str, state: BucketState) -> Result<(), StoreError> {
        let mut buckets = self.buckets.write().await;
        buckets.insert(key.to_string(), state);
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.buckets.write().await.clear();
        Ok(())
    }
}

#[async_trait]
impl AtomicStateStore for MemoryStore {
    async fn compare_and_set(
        &self,
        key: &str,
        expected: BucketState,
        next: BucketState,
    ) -> Result<bool, StoreError> {
        let mut buckets = self.buckets.write().await;
        let current = buckets.get(key).copied().unwrap_or(BucketState::NEVER_SEEN);
        if current != expected {
            return Ok(false);
        }

        buckets.insert(key.to_string(), next);
        Ok(true)
    }
}
