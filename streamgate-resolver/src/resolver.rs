//! Cache-aside stream resolver.
//!
//! `resolve` consults the cache, then takes the per-key lease so at most one
//! tool invocation per key is in flight across every process sharing the
//! store. Losers of the lease wait a bounded time for the winner's result
//! and report `Busy` if it has not landed.
//!
//! Each request counts once in the cache statistics: a hit, or a miss.
//! A record picked up after the miss is reported as a peer result.

use crate::backoff::{Retried, RetryFailure};
use crate::observer::{ResolutionEvent, ResolutionObserver};
use crate::throttler::ResolutionThrottler;
use crate::tool::ExtractionTool;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use streamgate_core::{
    ConfigError, LocatorRecord, ResolutionKey, ResolveError, ResolverConfig, RetryPolicy,
    StoreError, StreamgateResult,
};
use streamgate_storage::{
    InMemoryStore, KeyedStore, LeaseLock, LocatorCache, LockAcquisition, TimeoutStore,
};
use tokio::time::Instant;

/// One entry of a batch resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub key: ResolutionKey,
    /// Upstream-facing identifier handed to the tool, e.g. a channel URL.
    pub external_key: String,
}

impl ResolveRequest {
    pub fn new(key: ResolutionKey, external_key: impl Into<String>) -> Self {
        Self {
            key,
            external_key: external_key.into(),
        }
    }
}

/// Result of [`StreamResolver::resolve_many`], split by outcome.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub resolved: BTreeMap<String, LocatorRecord>,
    pub failed: BTreeMap<String, ResolveError>,
    /// Keys still resolving when the overall timeout elapsed.
    pub timed_out: Vec<String>,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.resolved.len() + self.failed.len() + self.timed_out.len()
    }
}

/// Keyed store for `config`: Redis when `redis_url` is set, in-memory
/// otherwise, with every call bounded by `store_timeout`.
pub async fn connect_store(config: &ResolverConfig) -> StreamgateResult<Arc<dyn KeyedStore>> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = streamgate_storage::RedisStore::connect(url).await?;
            Ok(Arc::new(TimeoutStore::new(store, config.store_timeout)))
        }
        #[cfg(not(feature = "redis"))]
        Some(url) => Err(ConfigError::InvalidValue {
            field: "redis_url".to_string(),
            value: url.clone(),
            reason: "built without the redis feature".to_string(),
        }
        .into()),
        None => {
            tracing::info!("No redis_url configured, using the in-memory store");
            Ok(Arc::new(TimeoutStore::new(
                InMemoryStore::new(),
                config.store_timeout,
            )))
        }
    }
}

pub struct StreamResolver {
    cache: LocatorCache,
    lock: LeaseLock,
    throttler: Arc<ResolutionThrottler>,
    observer: Arc<dyn ResolutionObserver>,
    lock_lease: Duration,
    contention_wait: Duration,
    contention_polls: u32,
    retry: RetryPolicy,
}

impl StreamResolver {
    pub fn new(
        store: Arc<dyn KeyedStore>,
        tool: Arc<dyn ExtractionTool>,
        observer: Arc<dyn ResolutionObserver>,
        config: &ResolverConfig,
    ) -> Self {
        let throttler = Arc::new(ResolutionThrottler::new(tool, config));
        Self::with_throttler(store, throttler, observer, config)
    }

    /// Build around an existing throttler, so several resolvers can share
    /// one concurrency bound.
    pub fn with_throttler(
        store: Arc<dyn KeyedStore>,
        throttler: Arc<ResolutionThrottler>,
        observer: Arc<dyn ResolutionObserver>,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            cache: LocatorCache::new(Arc::clone(&store)),
            lock: LeaseLock::new(store),
            throttler,
            observer,
            lock_lease: config.lock_lease,
            contention_wait: config.contention_wait,
            contention_polls: config.contention_polls.max(1),
            retry: config.retry.clone(),
        }
    }

    pub fn throttler(&self) -> &ResolutionThrottler {
        &self.throttler
    }

    pub fn cache(&self) -> &LocatorCache {
        &self.cache
    }

    /// Resolve `key`, invoking the tool with `external_key` on a miss.
    ///
    /// With `use_cache` false the cache is not read first, but a fresh
    /// result is still written back.
    pub async fn resolve(
        &self,
        key: &ResolutionKey,
        external_key: &str,
        use_cache: bool,
    ) -> Result<LocatorRecord, ResolveError> {
        let started = Instant::now();

        if use_cache {
            if let Some(record) = self.cache.get(key).await {
                self.emit(ResolutionEvent::CacheHit {
                    key: key.to_string(),
                });
                return Ok(record);
            }
            self.emit(ResolutionEvent::CacheMiss {
                key: key.to_string(),
            });
        }

        let guard = match self.lock.acquire(key, self.lock_lease).await {
            LockAcquisition::Granted(guard) => guard,
            LockAcquisition::Denied => {
                self.emit(ResolutionEvent::LockContention {
                    key: key.to_string(),
                });
                return self.await_peer(key).await;
            }
        };

        // If this future is dropped here the guard releases in the background.
        let outcome = self
            .resolve_locked(key, external_key, use_cache, guard.deadline(), started)
            .await;
        guard.release().await;
        outcome
    }

    async fn resolve_locked(
        &self,
        key: &ResolutionKey,
        external_key: &str,
        use_cache: bool,
        lease_deadline: Instant,
        started: Instant,
    ) -> Result<LocatorRecord, ResolveError> {
        // A peer may have written the record between our miss and our grant.
        if use_cache {
            if let Some(record) = self.cache.get(key).await {
                self.emit(ResolutionEvent::PeerResultUsed {
                    key: key.to_string(),
                });
                return Ok(record);
            }
        }

        let observer = &self.observer;
        let result = self
            .throttler
            .resolve_with_retry(
                key,
                external_key,
                &self.retry,
                Some(lease_deadline),
                |attempt| observer.observe(&ResolutionEvent::AttemptFinished(attempt)),
            )
            .await;

        match result {
            Ok(Retried {
                value: record,
                attempts,
            }) => {
                if let Err(e) = self.cache.store_record(key, &record).await {
                    tracing::warn!(key = %key, error = %e, "Failed to cache resolved record");
                    self.emit(ResolutionEvent::CacheWriteFailed {
                        key: key.to_string(),
                        reason: e.to_string(),
                    });
                }
                self.emit(ResolutionEvent::ResolutionSucceeded {
                    key: key.to_string(),
                    duration: started.elapsed(),
                    attempts,
                });
                Ok(record)
            }
            Err(RetryFailure { error, attempts }) => {
                self.emit(ResolutionEvent::ResolutionFailed {
                    key: key.to_string(),
                    cause: error.cause(),
                    duration: started.elapsed(),
                    attempts,
                });
                Err(ResolveError::from_upstream(key.as_str(), &error, attempts))
            }
        }
    }

    /// Bounded wait for another resolver's result after a lock denial.
    async fn await_peer(&self, key: &ResolutionKey) -> Result<LocatorRecord, ResolveError> {
        let interval = self.contention_wait / self.contention_polls;
        for _ in 0..self.contention_polls {
            tokio::time::sleep(interval).await;
            if let Some(record) = self.cache.get(key).await {
                self.emit(ResolutionEvent::PeerResultUsed {
                    key: key.to_string(),
                });
                return Ok(record);
            }
        }
        tracing::info!(key = %key, waited_ms = self.contention_wait.as_millis() as u64, "Key busy");
        Err(ResolveError::Busy {
            key: key.to_string(),
        })
    }

    /// Resolve every request concurrently, giving up on whatever is still
    /// running after `overall_timeout`. Abandoned resolutions release their
    /// leases in the background.
    pub async fn resolve_many(
        &self,
        requests: &[ResolveRequest],
        use_cache: bool,
        overall_timeout: Duration,
    ) -> BatchOutcome {
        let deadline = Instant::now() + overall_timeout;
        let mut pending: FuturesUnordered<_> = requests
            .iter()
            .map(|request| async move {
                let result = self
                    .resolve(&request.key, &request.external_key, use_cache)
                    .await;
                (request, result)
            })
            .collect();

        let mut outcome = BatchOutcome::default();
        let mut finished: HashSet<&str> = HashSet::new();
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((request, result))) => {
                    finished.insert(request.key.as_str());
                    match result {
                        Ok(record) => {
                            outcome.resolved.insert(request.key.to_string(), record);
                        }
                        Err(e) => {
                            outcome.failed.insert(request.key.to_string(), e);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        remaining = pending.len(),
                        timeout_ms = overall_timeout.as_millis() as u64,
                        "Batch resolution timed out"
                    );
                    break;
                }
            }
        }
        drop(pending);

        outcome.timed_out = requests
            .iter()
            .map(|request| request.key.as_str())
            .filter(|key| !finished.contains(key))
            .map(str::to_string)
            .collect();
        outcome
    }

    /// Drop the cached record for `key`; idempotent.
    pub async fn invalidate(&self, key: &ResolutionKey) -> Result<(), StoreError> {
        self.cache.invalidate(key).await?;
        tracing::info!(key = %key, "Cached record invalidated");
        Ok(())
    }

    /// Keys that currently have a cached record.
    pub async fn cached_keys(&self) -> Result<Vec<String>, StoreError> {
        self.cache.cached_keys().await
    }

    fn emit(&self, event: ResolutionEvent) {
        self.observer.observe(&event);
    }
}

// ============================================================================
// TESTS
// ============================================================================
