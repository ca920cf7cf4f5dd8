//! Streamgate Test Utilities
//!
//! Shared test infrastructure for the streamgate workspace:
//! - A scripted resolution tool that tracks concurrency
//! - A failure-injecting keyed store
//! - An observer that records every resolution event
//! - Proptest generators, fixtures and assertions

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use streamgate_core::StoreError;
use streamgate_storage::{InMemoryStore, KeyedStore, StoreResult};

// Re-export commonly used types for convenience
pub use streamgate_core::{
    FailureCause, LocatorRecord, ResolutionKey, ResolveError, ResolverConfig, RetryPolicy,
    UpstreamError,
};
pub use streamgate_resolver::{
    ExtractionTool, ResolutionEvent, ResolutionObserver, StreamResolver, ToolOutput,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// FAKE RESOLUTION TOOL
// ============================================================================

/// Scripted stand-in for the external resolution tool.
///
/// Scripted responses are consumed in order; once they run out every call
/// gets the fallback response. Each call blocks for `delay` to simulate a
/// slow subprocess, cut short at the call's timeout the way the real tool
/// is killed.
pub struct FakeTool {
    script: Mutex<VecDeque<Result<ToolOutput, UpstreamError>>>,
    fallback: Result<ToolOutput, UpstreamError>,
    delay: Duration,
    invocations: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl FakeTool {
    fn with_fallback(fallback: Result<ToolOutput, UpstreamError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            invocations: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        }
    }

    /// Always returns `locator`, advertising `ttl_hint` if given.
    pub fn succeeding(locator: &str, ttl_hint: Option<Duration>) -> Self {
        let output = ToolOutput::new(locator);
        Self::with_fallback(Ok(match ttl_hint {
            Some(ttl) => output.with_ttl_hint(ttl),
            None => output,
        }))
    }

    /// Always fails with `error`.
    pub fn failing(error: UpstreamError) -> Self {
        Self::with_fallback(Err(error))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue a response ahead of the fallback.
    pub fn then(self, response: Result<ToolOutput, UpstreamError>) -> Self {
        lock(&self.script).push_back(response);
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping calls observed so far.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// URLs passed to the tool, in call order.
    pub fn urls(&self) -> Vec<String> {
        lock(&self.urls).clone()
    }
}

impl ExtractionTool for FakeTool {
    fn invoke(&self, url: &str, timeout: Duration) -> Result<ToolOutput, UpstreamError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        lock(&self.urls).push(url.to_string());

        if self.delay > timeout {
            std::thread::sleep(timeout);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(UpstreamError::Timeout { after: timeout });
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let response = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

// ============================================================================
// FAILURE-INJECTING STORE
// ============================================================================

/// In-memory store whose operations can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_acquire: AtomicBool,
    fail_deletes: AtomicBool,
    before_acquire: Mutex<Option<(String, Vec<u8>, Duration)>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Write `value` under `key` right before the next lock acquire, as a
    /// peer that resolved and released just ahead of us would.
    pub fn write_before_next_acquire(&self, key: &str, value: &[u8], ttl: Duration) {
        *lock(&self.before_acquire) = Some((key.to_string(), value.to_vec(), ttl));
    }

    fn check(flag: &AtomicBool, operation: &'static str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                operation,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KeyedStore for FlakyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Self::check(&self.fail_reads, "get")?;
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        Self::check(&self.fail_writes, "set")?;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        Self::check(&self.fail_acquire, "set_if_absent")?;
        let staged = lock(&self.before_acquire).take();
        if let Some((staged_key, staged_value, staged_ttl)) = staged {
            self.inner
                .set_with_ttl(&staged_key, &staged_value, staged_ttl)
                .await?;
        }
        self.inner.set_if_absent_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        Self::check(&self.fail_deletes, "delete")?;
        self.inner.delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        Self::check(&self.fail_deletes, "delete_if_equals")?;
        self.inner.delete_if_equals(key, expected).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Self::check(&self.fail_reads, "scan")?;
        self.inner.keys_with_prefix(prefix).await
    }
}

// ============================================================================
// RECORDING OBSERVER
// ============================================================================

/// Keeps every event it is given.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ResolutionEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ResolutionEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, predicate: impl Fn(&ResolutionEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| predicate(e)).count()
    }

    pub fn cache_hits(&self) -> usize {
        self.count(|e| matches!(e, ResolutionEvent::CacheHit { .. }))
    }

    pub fn cache_misses(&self) -> usize {
        self.count(|e| matches!(e, ResolutionEvent::CacheMiss { .. }))
    }

    pub fn peer_results(&self) -> usize {
        self.count(|e| matches!(e, ResolutionEvent::PeerResultUsed { .. }))
    }

    pub fn contentions(&self) -> usize {
        self.count(|e| matches!(e, ResolutionEvent::LockContention { .. }))
    }

    /// Causes of every `ResolutionFailed` event, in order.
    pub fn failure_causes(&self) -> Vec<FailureCause> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                ResolutionEvent::ResolutionFailed { cause, .. } => Some(*cause),
                _ => None,
            })
            .collect()
    }
}

impl ResolutionObserver for RecordingObserver {
    fn observe(&self, event: &ResolutionEvent) {
        lock(&self.events).push(event.clone());
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for streamgate types.

    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// Generate a valid resolution key.
    pub fn arb_resolution_key() -> impl Strategy<Value = ResolutionKey> {
        "[a-z][a-z0-9_-]{0,31}".prop_filter_map("valid key", |s| ResolutionKey::new(s).ok())
    }

    /// Generate a well-formed locator record issued between 2020 and 2030.
    pub fn arb_locator_record() -> impl Strategy<Value = LocatorRecord> {
        (
            1_577_836_800i64..1_893_456_000i64,
            1u64..86_400,
            prop::sample::select(vec!["hls", "dash"]),
        )
            .prop_filter_map("valid record", |(issued_secs, validity, format)| {
                let issued = Utc.timestamp_opt(issued_secs, 0).single()?;
                let attributes = BTreeMap::from([("format".to_string(), format.to_string())]);
                LocatorRecord::issue(
                    format!("https://cdn.example.com/{}/index.m3u8", issued_secs),
                    attributes,
                    issued,
                    Duration::from_secs(validity),
                )
                .ok()
            })
    }

    /// Generate an upstream error the backoff executor should retry.
    pub fn arb_transient_error() -> impl Strategy<Value = UpstreamError> {
        prop_oneof![
            (1u64..60).prop_map(|s| UpstreamError::Timeout {
                after: Duration::from_secs(s)
            }),
            (any::<Option<i32>>(), "[a-z ]{0,20}")
                .prop_map(|(status, stderr)| UpstreamError::NonZeroExit { status, stderr }),
            "[a-z ]{1,20}".prop_map(|reason| UpstreamError::MalformedOutput { reason }),
            "[a-z ]{1,20}".prop_map(|reason| UpstreamError::LaunchFailed { reason }),
        ]
    }

    /// Generate any upstream error.
    pub fn arb_upstream_error() -> impl Strategy<Value = UpstreamError> {
        prop_oneof![
            3 => arb_transient_error(),
            1 => "[a-z ]{1,20}".prop_map(|reason| UpstreamError::ResourceUnavailable { reason }),
            1 => "[a-z ]{1,20}".prop_map(|reason| UpstreamError::InvalidInput { reason }),
            1 => (0u64..1_000).prop_map(|ms| UpstreamError::LeaseExhausted {
                remaining: Duration::from_millis(ms)
            }),
        ]
    }

    /// Generate a retry policy with millisecond-scale delays.
    pub fn arb_fast_retry_policy() -> impl Strategy<Value = RetryPolicy> {
        (1u32..6, 1u64..5, 0u64..10, 1.0f64..3.0, any::<bool>()).prop_map(
            |(max_attempts, initial_ms, extra_ms, multiplier, jitter)| RetryPolicy {
                max_attempts,
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(initial_ms + extra_ms),
                multiplier,
                jitter,
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common resolver scenarios.

    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    pub const NEWS1_LOCATOR: &str = "https://x/y.m3u8";

    /// Build a key, panicking on invalid input.
    pub fn key(name: &str) -> ResolutionKey {
        match ResolutionKey::new(name) {
            Ok(key) => key,
            Err(e) => panic!("invalid fixture key {name:?}: {e}"),
        }
    }

    /// External URL used for a fixture key.
    pub fn channel_url(name: &str) -> String {
        format!("https://www.youtube.com/@{}/live", name)
    }

    /// Default configuration with delays shrunk for tests.
    ///
    /// Retries back off for a few milliseconds and lock losers wait 200ms.
    pub fn fast_config() -> ResolverConfig {
        ResolverConfig {
            contention_wait: Duration::from_millis(200),
            contention_polls: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(2),
                max_delay: Duration::from_millis(10),
                multiplier: 2.0,
                jitter: true,
            },
            ..ResolverConfig::default()
        }
    }

    /// Tool that resolves every key to [`NEWS1_LOCATOR`] valid for an hour.
    pub fn news1_tool() -> FakeTool {
        FakeTool::succeeding(NEWS1_LOCATOR, Some(Duration::from_secs(3600)))
    }

    /// A record whose window closed one second ago.
    pub fn expired_record() -> LocatorRecord {
        let now = Utc::now();
        match LocatorRecord::new(
            NEWS1_LOCATOR,
            BTreeMap::new(),
            now - chrono::Duration::seconds(3600),
            now - chrono::Duration::seconds(1),
        ) {
            Ok(record) => record,
            Err(e) => panic!("fixture record invalid: {e}"),
        }
    }

    /// A transient tool failure.
    pub fn http_503() -> UpstreamError {
        UpstreamError::NonZeroExit {
            status: Some(1),
            stderr: "ERROR: HTTP Error 503: Service Unavailable".to_string(),
        }
    }

    /// The tool ran but the channel is offline.
    pub fn not_live() -> UpstreamError {
        UpstreamError::ResourceUnavailable {
            reason: "This channel is not currently live".to_string(),
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for resolver outcomes.

    use super::*;

    /// Assert that a resolution returned `Busy`.
    #[track_caller]
    pub fn assert_busy<T: std::fmt::Debug>(result: &Result<T, ResolveError>) {
        match result {
            Err(ResolveError::Busy { .. }) => {}
            other => panic!("Expected Busy, got: {:?}", other),
        }
    }

    /// Assert that a resolution failed upstream with `expected` after
    /// `attempts` attempts.
    #[track_caller]
    pub fn assert_upstream_failed<T: std::fmt::Debug>(
        result: &Result<T, ResolveError>,
        expected: FailureCause,
        expected_attempts: u32,
    ) {
        match result {
            Err(ResolveError::UpstreamFailed {
                cause, attempts, ..
            }) => {
                assert_eq!(*cause, expected, "Wrong failure cause");
                assert_eq!(*attempts, expected_attempts, "Wrong attempt count");
            }
            other => panic!("Expected UpstreamFailed({}), got: {:?}", expected, other),
        }
    }

    /// Assert that a resolution reported the resource as unavailable.
    #[track_caller]
    pub fn assert_unavailable<T: std::fmt::Debug>(result: &Result<T, ResolveError>) {
        match result {
            Err(ResolveError::ResourceUnavailable { .. }) => {}
            other => panic!("Expected ResourceUnavailable, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
