//! Pluggable persistence for bucket state.
//!
//! A limiter never holds bucket state itself; every decision reads the pair
//! `(allowance, last_accessed_ns)` from a [`StateStore`] and writes the new
//! pair back. Pointing several processes at one external store makes them
//! share a single logical limit.

pub mod encoding;
pub mod memory;
pub mod redis;

use crate::error::StoreError;
use crate::token_bucket::BucketState;
use async_trait::async_trait;
use std::sync::Arc;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisHashStore, RedisStringStore};

/// Storage capability backing a rate limiter.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the state for `key`.
    ///
    /// Must return [`BucketState::NEVER_SEEN`] for a key with no record.
    /// Any other failure is an error, never a silent zero.
    async fn get_state(&self, key: &str) -> Result<BucketState, StoreError>;

    /// Unconditionally overwrite the state for `key`.
    async fn set_state(&self, key: &str, state: BucketState) -> Result<(), StoreError>;

    /// Remove every key. Administrative and test use only.
    async fn flush_all(&self) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("flush_all"))
    }

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A store that can write conditionally on the state it last returned.
#[async_trait]
pub trait AtomicStateStore: StateStore {
    /// Write `next` only if the stored state still equals `expected`.
    ///
    /// A missing record compares equal to [`BucketState::NEVER_SEEN`].
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: BucketState,
        next: BucketState,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn get_state(&self, key: &str) -> Result<BucketState, StoreError> {
        self.as_ref().get_state(key).await
    }

    async fn set_state(&self, key: &str, state: BucketState) -> Result<(), StoreError> {
        self.as_ref().set_state(key, state).await
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.as_ref().flush_all().await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.as_ref().ping().await
    }
}

#[async_trait]
impl<T: AtomicStateStore + ?Sized> AtomicStateStore for Arc<T> {
    async fn compare_and_set(
        &self,
        key: &str,
        expected: BucketState,
        next: BucketState,
    ) -> Result<bool, StoreError> {
        self.as_ref().compare_and_set(key, expected, next).await
    }
}
