//! Per-key lease lock over a keyed store.
//!
//! A lease is a single `lock:<key>` marker written with set-if-absent and a
//! TTL. The marker holds a token unique to the grant, and a guard only ever
//! deletes its own token, so a holder whose lease lapsed cannot release a
//! successor's lease. Acquisition never blocks; callers pick their own wait
//! policy. An abandoned lease expires on its own after the lease duration.

use crate::store::KeyedStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use streamgate_core::{LockLease, ResolutionKey};
use tokio::time::Instant;
use uuid::Uuid;

/// Store key prefix for lock markers.
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// Result of a non-blocking lock attempt.
#[derive(Debug)]
pub enum LockAcquisition {
    Granted(LeaseGuard),
    Denied,
}

impl LockAcquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockAcquisition::Granted(_))
    }
}

/// Distributed mutual exclusion keyed by resolution key.
#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn KeyedStore>,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn KeyedStore>) -> Self {
        Self { store }
    }

    pub fn lock_key(key: &ResolutionKey) -> String {
        format!("{}{}", LOCK_KEY_PREFIX, key.as_str())
    }

    /// Try to take the lease for `key`.
    ///
    /// A store error is reported as `Denied`: exclusive access is never
    /// assumed when the store cannot confirm it.
    pub async fn acquire(&self, key: &ResolutionKey, lease: Duration) -> LockAcquisition {
        let store_key = Self::lock_key(key);
        let token = Uuid::now_v7().to_string();
        // Taken before the write so the local deadline never trails the store's.
        let started = Instant::now();
        let acquired_at = Utc::now();
        match self
            .store
            .set_if_absent_with_ttl(&store_key, token.as_bytes(), lease)
            .await
        {
            Ok(true) => {
                tracing::debug!(key = %key, lease_ms = lease.as_millis() as u64, "Lock granted");
                LockAcquisition::Granted(LeaseGuard {
                    store: Arc::clone(&self.store),
                    store_key,
                    token,
                    deadline: started.checked_add(lease).unwrap_or(started),
                    lease: LockLease::new(key.as_str(), acquired_at, lease),
                    released: false,
                })
            }
            Ok(false) => {
                tracing::debug!(key = %key, "Lock held elsewhere");
                LockAcquisition::Denied
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Lock acquire failed, treating as denied");
                LockAcquisition::Denied
            }
        }
    }

    /// Operator release of `key`'s lease, whoever holds it.
    pub async fn force_release(&self, key: &ResolutionKey) {
        let store_key = Self::lock_key(key);
        if let Err(e) = self.store.delete(&store_key).await {
            tracing::warn!(lock = %store_key, error = %e, "Lock release failed");
        }
    }
}

async fn release_owned(store: &dyn KeyedStore, store_key: &str, token: &str) {
    match store.delete_if_equals(store_key, token.as_bytes()).await {
        Ok(true) => tracing::debug!(lock = store_key, "Lock released"),
        Ok(false) => {
            tracing::warn!(lock = store_key, "Lease lapsed before release, leaving current holder alone")
        }
        // The marker still self-expires at the end of the lease.
        Err(e) => tracing::warn!(lock = store_key, error = %e, "Lock release failed"),
    }
}

/// A granted lease. Released explicitly with [`LeaseGuard::release`], or in
/// the background when dropped unreleased (including on task cancellation).
#[derive(Debug)]
pub struct LeaseGuard {
    store: Arc<dyn KeyedStore>,
    store_key: String,
    token: String,
    deadline: Instant,
    lease: LockLease,
    released: bool,
}

impl LeaseGuard {
    pub fn lease(&self) -> &LockLease {
        &self.lease
    }

    /// Instant after which the store may hand the lease to someone else.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left on the lease, zero once it has lapsed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub async fn release(mut self) {
        self.released = true;
        release_owned(self.store.as_ref(), &self.store_key, &self.token).await;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let store_key = std::mem::take(&mut self.store_key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_owned(store.as_ref(), &store_key, &token).await;
                });
            }
            Err(_) => {
                tracing::warn!(lock = %store_key, "No runtime to release lock, leaving it to expire");
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
