//! In-process keyed store.
//!
//! Used in tests and in single-node deployments without Redis. Expiry is
//! lazy: an expired entry is dropped the next time it is touched, or by
//! [`InMemoryStore::purge_expired`].

use super::{ensure_ttl, KeyedStore, StoreResult};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn new(value: &[u8], ttl: Duration, now: Instant) -> Self {
        let expires_at = now.checked_add(ttl).unwrap_or_else(far_future);
        Self {
            value: value.to_vec(),
            expires_at,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

// Roughly thirty years out; used when `now + ttl` overflows.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}

/// Concurrent in-memory store backed by a sharded map.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl KeyedStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = Instant::now();
        if let Some(stored) = self.entries.get(key) {
            if stored.is_live(now) {
                return Ok(Some(stored.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, stored| !stored.is_live(now));
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        ensure_ttl(key, ttl)?;
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl, Instant::now()));
        Ok(())
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        ensure_ttl(key, ttl)?;
        let now = Instant::now();
        // The entry guard holds the shard lock, so check-and-insert is atomic.
        let written = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(StoredValue::new(value, ttl, now));
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl, now));
                true
            }
        };
        Ok(written)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, stored| stored.is_live(now) && stored.value == expected)
            .is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use streamgate_core::StoreError;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryStore::new();
        store
            .set_with_ttl("stream:news1", b"payload", Duration::from_secs(60))
            .await
            .expect("set should succeed");

        let value = store.get("stream:news1").await.expect("get should succeed");
        assert_eq!(value.as_deref(), Some(&b"payload"[..]));

        store.delete("stream:news1").await.expect("delete should succeed");
        store.delete("stream:news1").await.expect("second delete should succeed");
        assert_eq!(store.get("stream:news1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let store = InMemoryStore::new();
        let result = store.set_with_ttl("k", b"v", Duration::ZERO).await;
        assert!(matches!(result, Err(StoreError::InvalidTtl { .. })));
        let result = store.set_if_absent_with_ttl("k", b"v", Duration::ZERO).await;
        assert!(matches!(result, Err(StoreError::InvalidTtl { .. })));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = InMemoryStore::new();
        store
            .set_with_ttl("k", b"v", Duration::from_millis(30))
            .await
            .expect("set should succeed");
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.get("k").await.expect("get"), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_if_absent_respects_live_and_expired_entries() {
        let store = InMemoryStore::new();
        assert!(store
            .set_if_absent_with_ttl("lock:a", b"1", Duration::from_millis(40))
            .await
            .expect("first acquire"));
        assert!(!store
            .set_if_absent_with_ttl("lock:a", b"1", Duration::from_millis(40))
            .await
            .expect("second acquire"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store
            .set_if_absent_with_ttl("lock:a", b"1", Duration::from_millis(40))
            .await
            .expect("acquire after expiry"));
    }

    #[tokio::test]
    async fn test_delete_if_equals_only_removes_matching_value() {
        let store = InMemoryStore::new();
        store
            .set_with_ttl("lock:a", b"owner-1", Duration::from_secs(30))
            .await
            .expect("set");

        assert!(!store
            .delete_if_equals("lock:a", b"owner-2")
            .await
            .expect("mismatched delete"));
        assert!(store.get("lock:a").await.expect("get").is_some());

        assert!(store
            .delete_if_equals("lock:a", b"owner-1")
            .await
            .expect("matching delete"));
        assert_eq!(store.get("lock:a").await.expect("get"), None);
        assert!(!store
            .delete_if_equals("lock:a", b"owner-1")
            .await
            .expect("absent delete"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_set_if_absent_single_winner_under_contention() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .set_if_absent_with_ttl("lock:hot", b"1", Duration::from_secs(30))
                    .await
                    .expect("acquire should not error")
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("task should not panic") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_keys_with_prefix_skips_expired() {
        let store = InMemoryStore::new();
        store
            .set_with_ttl("stream:a", b"1", Duration::from_secs(60))
            .await
            .expect("set a");
        store
            .set_with_ttl("stream:b", b"1", Duration::from_millis(10))
            .await
            .expect("set b");
        store
            .set_with_ttl("lock:a", b"1", Duration::from_secs(60))
            .await
            .expect("set lock");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let keys = store.keys_with_prefix("stream:").await.expect("scan");
        assert_eq!(keys, vec!["stream:a".to_string()]);
        assert_eq!(store.purge_expired(), 1);
    }
}
