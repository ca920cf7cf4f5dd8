//! Locator cache over a keyed store.
//!
//! Records are stored as JSON under `stream:<key>`. Reads fail open: any
//! store error, decode failure or expired record reads as absent, and the
//! caller re-resolves.

use crate::store::{KeyedStore, StoreResult};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use streamgate_core::{LocatorRecord, ResolutionKey, StoreError};

/// Store key prefix for cached locator records.
pub const CACHE_KEY_PREFIX: &str = "stream:";

/// TTL-bounded cache of locator records keyed by resolution key.
#[derive(Clone)]
pub struct LocatorCache {
    store: Arc<dyn KeyedStore>,
}

impl LocatorCache {
    pub fn new(store: Arc<dyn KeyedStore>) -> Self {
        Self { store }
    }

    /// Store key under which `key`'s record lives.
    pub fn cache_key(key: &ResolutionKey) -> String {
        format!("{}{}", CACHE_KEY_PREFIX, key.as_str())
    }

    /// Return the live record for `key`, or `None`.
    ///
    /// A record whose `expires_at` has passed is treated as absent even if
    /// the store still holds it.
    pub async fn get(&self, key: &ResolutionKey) -> Option<LocatorRecord> {
        let store_key = Self::cache_key(key);
        let bytes = match self.store.get(&store_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        let record: LocatorRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cached record could not be decoded");
                return None;
            }
        };

        if !record.is_well_formed() {
            tracing::warn!(key = %key, "Cached record violates its validity window");
            return None;
        }
        if record.is_expired_at(Utc::now()) {
            tracing::debug!(key = %key, expires_at = %record.expires_at, "Cached record expired");
            return None;
        }
        Some(record)
    }

    /// Write `record` with an explicit TTL.
    pub async fn set(
        &self,
        key: &ResolutionKey,
        record: &LocatorRecord,
        ttl: Duration,
    ) -> StoreResult<()> {
        let store_key = Self::cache_key(key);
        if ttl.is_zero() {
            return Err(StoreError::InvalidTtl { key: store_key });
        }
        let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Serialization {
            key: store_key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set_with_ttl(&store_key, &bytes, ttl).await
    }

    /// Write `record` with a TTL equal to the time it has left to live.
    ///
    /// The store entry therefore expires together with the locator.
    pub async fn store_record(&self, key: &ResolutionKey, record: &LocatorRecord) -> StoreResult<()> {
        let ttl = record
            .remaining_ttl(Utc::now())
            .filter(|ttl| !ttl.is_zero())
            .ok_or_else(|| StoreError::InvalidTtl {
                key: Self::cache_key(key),
            })?;
        self.set(key, record, ttl).await
    }

    /// Remove the record for `key`. Removing an absent key succeeds.
    pub async fn invalidate(&self, key: &ResolutionKey) -> StoreResult<()> {
        self.store.delete(&Self::cache_key(key)).await
    }

    /// Resolution keys that currently have a cached record.
    pub async fn cached_keys(&self) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .store
            .keys_with_prefix(CACHE_KEY_PREFIX)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(CACHE_KEY_PREFIX).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// TESTS
// ============================================================================
