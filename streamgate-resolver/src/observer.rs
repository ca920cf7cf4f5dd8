//! Resolution events for the observability collaborator.
//!
//! Observers are synchronous and must not block: they run inline on the
//! resolution path.

use std::sync::Arc;
use std::time::Duration;
use streamgate_core::{AttemptOutcome, FailureCause, ResolutionAttempt};

/// A discrete event emitted by the stream resolver.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionEvent {
    CacheHit {
        key: String,
    },
    CacheMiss {
        key: String,
    },
    /// A record another resolver wrote after this request's cache miss.
    /// Not a cache hit: the request already counted as a miss.
    PeerResultUsed {
        key: String,
    },
    /// The per-key lock was held elsewhere.
    LockContention {
        key: String,
    },
    AttemptFinished(ResolutionAttempt),
    ResolutionSucceeded {
        key: String,
        duration: Duration,
        attempts: u32,
    },
    ResolutionFailed {
        key: String,
        cause: FailureCause,
        duration: Duration,
        attempts: u32,
    },
    /// A resolved record could not be written back to the cache.
    CacheWriteFailed {
        key: String,
        reason: String,
    },
}

impl ResolutionEvent {
    pub fn key(&self) -> &str {
        match self {
            ResolutionEvent::CacheHit { key }
            | ResolutionEvent::CacheMiss { key }
            | ResolutionEvent::PeerResultUsed { key }
            | ResolutionEvent::LockContention { key }
            | ResolutionEvent::ResolutionSucceeded { key, .. }
            | ResolutionEvent::ResolutionFailed { key, .. }
            | ResolutionEvent::CacheWriteFailed { key, .. } => key,
            ResolutionEvent::AttemptFinished(attempt) => &attempt.key,
        }
    }
}

/// Receives resolution events. Fire-and-forget.
pub trait ResolutionObserver: Send + Sync {
    fn observe(&self, event: &ResolutionEvent);
}

impl<T: ResolutionObserver + ?Sized> ResolutionObserver for Arc<T> {
    fn observe(&self, event: &ResolutionEvent) {
        (**self).observe(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ResolutionObserver for NoopObserver {
    fn observe(&self, _event: &ResolutionEvent) {}
}

/// Writes events as structured log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ResolutionObserver for TracingObserver {
    fn observe(&self, event: &ResolutionEvent) {
        match event {
            ResolutionEvent::CacheHit { key } => {
                tracing::debug!(key = %key, "Cache hit");
            }
            ResolutionEvent::CacheMiss { key } => {
                tracing::debug!(key = %key, "Cache miss");
            }
            ResolutionEvent::PeerResultUsed { key } => {
                tracing::debug!(key = %key, "Using record resolved by a peer");
            }
            ResolutionEvent::LockContention { key } => {
                tracing::info!(key = %key, "Resolution already in progress elsewhere");
            }
            ResolutionEvent::AttemptFinished(attempt) => match attempt.outcome {
                AttemptOutcome::Failed { cause, retryable } => tracing::warn!(
                    key = %attempt.key,
                    attempt = attempt.attempt_number,
                    cause = %cause,
                    retryable,
                    elapsed_ms = attempt.elapsed.as_millis() as u64,
                    "Resolution attempt failed"
                ),
                _ => tracing::debug!(
                    key = %attempt.key,
                    attempt = attempt.attempt_number,
                    elapsed_ms = attempt.elapsed.as_millis() as u64,
                    "Resolution attempt finished"
                ),
            },
            ResolutionEvent::ResolutionSucceeded {
                key,
                duration,
                attempts,
            } => {
                tracing::info!(
                    key = %key,
                    attempts,
                    duration_ms = duration.as_millis() as u64,
                    "Stream resolved"
                );
            }
            ResolutionEvent::ResolutionFailed {
                key,
                cause,
                duration,
                attempts,
            } => {
                tracing::error!(
                    key = %key,
                    cause = %cause,
                    attempts,
                    duration_ms = duration.as_millis() as u64,
                    "Stream resolution failed"
                );
            }
            ResolutionEvent::CacheWriteFailed { key, reason } => {
                tracing::debug!(key = %key, reason = %reason, "Resolved record not cached");
            }
        }
    }
}

/// Fans every event out to several observers.
#[derive(Clone, Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ResolutionObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn ResolutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl ResolutionObserver for CompositeObserver {
    fn observe(&self, event: &ResolutionEvent) {
        for observer in &self.observers {
            observer.observe(event);
        }
    }
}
