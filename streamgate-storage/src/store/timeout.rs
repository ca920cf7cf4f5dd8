//! Client-side timeout for keyed store calls.

use super::{KeyedStore, StoreResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use streamgate_core::StoreError;

/// Wraps a store so every call fails with [`StoreError::Timeout`] once it
/// exceeds `timeout`.
#[derive(Debug, Clone)]
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: KeyedStore> TimeoutStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl<S: KeyedStore> KeyedStore for TimeoutStore<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.bounded("set", self.inner.set_with_ttl(key, value, ttl))
            .await
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.bounded(
            "set_if_absent",
            self.inner.set_if_absent_with_ttl(key, value, ttl),
        )
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.bounded("delete", self.inner.delete(key)).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        self.bounded("delete_if_equals", self.inner.delete_if_equals(key, expected))
            .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.bounded("scan", self.inner.keys_with_prefix(prefix))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    struct StalledStore;

    #[async_trait]
    impl KeyedStore for StalledStore {
        async fn get(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        async fn set_with_ttl(&self, _key: &str, _value: &[u8], _ttl: Duration) -> StoreResult<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn set_if_absent_with_ttl(
            &self,
            _key: &str,
            _value: &[u8],
            _ttl: Duration,
        ) -> StoreResult<bool> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(true)
        }

        async fn delete(&self, _key: &str) -> StoreResult<()> {
            Ok(())
        }

        async fn delete_if_equals(&self, _key: &str, _expected: &[u8]) -> StoreResult<bool> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(true)
        }

        async fn keys_with_prefix(&self, _prefix: &str) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_stalled_call_times_out() {
        let store = TimeoutStore::new(StalledStore, Duration::from_millis(20));

        let result = store.get("stream:news1").await;
        assert!(matches!(
            result,
            Err(StoreError::Timeout { operation: "get", .. })
        ));

        let result = store
            .set_if_absent_with_ttl("lock:news1", b"1", Duration::from_secs(30))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::Timeout {
                operation: "set_if_absent",
                ..
            })
        ));

        let result = store.delete_if_equals("lock:news1", b"token").await;
        assert!(matches!(
            result,
            Err(StoreError::Timeout {
                operation: "delete_if_equals",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_fast_calls_pass_through() {
        let store = TimeoutStore::new(InMemoryStore::new(), Duration::from_secs(1));
        store
            .set_with_ttl("k", b"v", Duration::from_secs(5))
            .await
            .expect("set should succeed");
        assert_eq!(store.get("k").await.expect("get").as_deref(), Some(&b"v"[..]));
        assert_eq!(store.timeout(), Duration::from_secs(1));
    }
}
