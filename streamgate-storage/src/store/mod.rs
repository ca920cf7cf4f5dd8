//! Keyed store contract and implementations.
//!
//! The contract is small: TTL writes, reads, deletes, an atomic
//! set-if-absent that the lock is built on, and an atomic compare-and-delete
//! for releasing it. Values are opaque bytes.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;
mod timeout;

pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use timeout::TimeoutStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use streamgate_core::StoreError;

/// Result type for keyed store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// External key/value store with TTL and atomic set-if-absent.
///
/// Implementations must be safe to share between tasks. `set_if_absent_with_ttl`
/// must be atomic: of any number of concurrent callers for an absent key,
/// exactly one observes `true`.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Read a live value; expired entries read as `None`.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write a value that expires after `ttl`. A zero TTL is rejected.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Write only if no live value exists. Returns whether the write happened.
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Remove a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Remove `key` only while its live value equals `expected`, atomically.
    /// Returns whether the key was removed.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool>;

    /// List live keys starting with `prefix`, in no particular order.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

impl std::fmt::Debug for dyn KeyedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyedStore")
    }
}

#[async_trait]
impl<S: KeyedStore + ?Sized> KeyedStore for Arc<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        (**self).set_if_absent_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        (**self).delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        (**self).delete_if_equals(key, expected).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        (**self).keys_with_prefix(prefix).await
    }
}

pub(crate) fn ensure_ttl(key: &str, ttl: Duration) -> StoreResult<()> {
    if ttl.is_zero() {
        return Err(StoreError::InvalidTtl {
            key: key.to_string(),
        });
    }
    Ok(())
}
