//! End-to-end behaviour of the stream resolver against an in-process store
//! and a scripted resolution tool.

use std::sync::Arc;
use std::time::Duration;
use streamgate_core::ResolverConfig;
use streamgate_resolver::{ResolutionEvent, ResolveRequest, StreamResolver};
use streamgate_storage::{InMemoryStore, KeyedStore, LeaseLock, LockAcquisition, LocatorCache};
use streamgate_test_utils::assertions::{assert_busy, assert_unavailable, assert_upstream_failed};
use streamgate_test_utils::fixtures::{self, key, NEWS1_LOCATOR};
use streamgate_test_utils::{FailureCause, FakeTool, FlakyStore, RecordingObserver};

struct Harness {
    resolver: StreamResolver,
    tool: Arc<FakeTool>,
    store: Arc<InMemoryStore>,
    observer: Arc<RecordingObserver>,
}

fn harness(tool: FakeTool, config: ResolverConfig) -> Harness {
    let tool = Arc::new(tool);
    let store = Arc::new(InMemoryStore::new());
    let observer = Arc::new(RecordingObserver::new());
    let resolver = StreamResolver::new(store.clone(), tool.clone(), observer.clone(), &config);
    Harness {
        resolver,
        tool,
        store,
        observer,
    }
}

// ============================================================================
// CACHE-ASIDE
// ============================================================================

#[tokio::test]
async fn test_news1_resolves_once_then_serves_from_cache() {
    let h = harness(fixtures::news1_tool(), fixtures::fast_config());
    let news1 = key("news1");

    let first = h
        .resolver
        .resolve(&news1, &fixtures::channel_url("news1"), true)
        .await
        .expect("first resolve");
    assert_eq!(first.locator, NEWS1_LOCATOR);
    assert_eq!(first.validity(), Duration::from_secs(3600));
    assert_eq!(h.tool.invocations(), 1);
    assert_eq!(h.tool.urls(), vec![fixtures::channel_url("news1")]);

    let second = h
        .resolver
        .resolve(&news1, &fixtures::channel_url("news1"), true)
        .await
        .expect("second resolve");
    assert_eq!(second, first);
    assert_eq!(h.tool.invocations(), 1, "cache hit must not invoke the tool");

    assert_eq!(h.observer.cache_misses(), 1);
    assert_eq!(h.observer.cache_hits(), 1);
    assert!(h
        .observer
        .events()
        .iter()
        .any(|e| matches!(e, ResolutionEvent::ResolutionSucceeded { attempts: 1, .. })));
}

#[tokio::test]
async fn test_expired_record_reads_as_absent() {
    let h = harness(fixtures::news1_tool(), fixtures::fast_config());
    let news1 = key("news1");

    // The store keeps the entry for another minute, but the record itself
    // has already expired.
    h.resolver
        .cache()
        .set(&news1, &fixtures::expired_record(), Duration::from_secs(60))
        .await
        .expect("inject expired record");
    assert!(h.store.get("stream:news1").await.expect("read").is_some());
    assert_eq!(h.resolver.cache().get(&news1).await, None);

    let record = h
        .resolver
        .resolve(&news1, &fixtures::channel_url("news1"), true)
        .await
        .expect("re-resolves");
    assert!(!record.is_expired());
    assert_eq!(h.tool.invocations(), 1);
}

#[tokio::test]
async fn test_ttl_never_exceeds_ceiling() {
    let mut config = fixtures::fast_config();
    config.cache_ttl_ceiling = Duration::from_secs(600);
    let tool = FakeTool::succeeding(NEWS1_LOCATOR, Some(Duration::from_secs(86_400)));
    let h = harness(tool, config);

    let record = h
        .resolver
        .resolve(&key("news1"), &fixtures::channel_url("news1"), true)
        .await
        .expect("resolve");
    assert_eq!(record.validity(), Duration::from_secs(600));
}

// ============================================================================
// MUTUAL EXCLUSION
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_invoke_tool_once() {
    let mut config = fixtures::fast_config();
    config.contention_wait = Duration::from_secs(2);
    config.contention_polls = 20;

    let tool = Arc::new(fixtures::news1_tool().with_delay(Duration::from_millis(150)));
    let store = Arc::new(InMemoryStore::new());

    // Two resolvers over one store stand in for two processes.
    let resolvers: Vec<Arc<StreamResolver>> = (0..2)
        .map(|_| {
            Arc::new(StreamResolver::new(
                store.clone(),
                tool.clone(),
                Arc::new(RecordingObserver::new()),
                &config,
            ))
        })
        .collect();

    let mut handles = Vec::new();
    for i in 0..8 {
        let resolver = Arc::clone(&resolvers[i % 2]);
        handles.push(tokio::spawn(async move {
            resolver
                .resolve(&key("news1"), &fixtures::channel_url("news1"), true)
                .await
        }));
    }

    for handle in handles {
        let record = handle
            .await
            .expect("task should not panic")
            .expect("every caller gets the winner's record");
        assert_eq!(record.locator, NEWS1_LOCATOR);
    }
    assert_eq!(tool.invocations(), 1);
    assert_eq!(tool.max_in_flight(), 1);
}

#[tokio::test]
async fn test_held_lock_reports_busy_within_bounded_wait() {
    let h = harness(fixtures::news1_tool(), fixtures::fast_config());
    h.store
        .set_with_ttl("lock:news1", b"1", Duration::from_secs(30))
        .await
        .expect("pre-set marker");

    let started = std::time::Instant::now();
    let result = h
        .resolver
        .resolve(&key("news1"), &fixtures::channel_url("news1"), true)
        .await;

    assert_busy(&result);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.tool.invocations(), 0);
    assert_eq!(h.observer.contentions(), 1);
    // The marker belongs to someone else and is left alone.
    assert!(h.store.get("lock:news1").await.expect("read").is_some());
}

#[tokio::test]
async fn test_lock_loser_picks_up_peer_result() {
    let h = harness(fixtures::news1_tool(), fixtures::fast_config());
    let news1 = key("news1");
    h.store
        .set_with_ttl("lock:news1", b"1", Duration::from_secs(30))
        .await
        .expect("pre-set marker");

    let cache = h.resolver.cache().clone();
    let peer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        let record = streamgate_test_utils::LocatorRecord::issue(
            "https://peer/live.m3u8",
            Default::default(),
            chrono::Utc::now(),
            Duration::from_secs(600),
        )
        .expect("valid record");
        cache.store_record(&news1, &record).await.expect("peer write");
    });

    let record = h
        .resolver
        .resolve(&key("news1"), &fixtures::channel_url("news1"), true)
        .await
        .expect("peer's record");
    peer.await.expect("peer task");

    assert_eq!(record.locator, "https://peer/live.m3u8");
    assert_eq!(h.tool.invocations(), 0);
    // One request, one miss: the waited-for record is not a second lookup.
    assert_eq!(h.observer.cache_misses(), 1);
    assert_eq!(h.observer.cache_hits(), 0);
    assert_eq!(h.observer.peer_results(), 1);
}

#[tokio::test]
async fn test_record_landing_before_grant_counts_as_one_miss() {
    let store = Arc::new(FlakyStore::new());
    let tool = Arc::new(fixtures::news1_tool());
    let observer = Arc::new(RecordingObserver::new());
    let resolver = StreamResolver::new(
        store.clone(),
        tool.clone(),
        observer.clone(),
        &fixtures::fast_config(),
    );
    let news1 = key("news1");

    // Encode a peer's record through a scratch cache, then have it land
    // between our miss and our lock grant.
    let scratch = Arc::new(InMemoryStore::new());
    let peer = streamgate_test_utils::LocatorRecord::issue(
        "https://peer/live.m3u8",
        Default::default(),
        chrono::Utc::now(),
        Duration::from_secs(600),
    )
    .expect("valid record");
    LocatorCache::new(scratch.clone())
        .store_record(&news1, &peer)
        .await
        .expect("scratch write");
    let encoded = scratch
        .get("stream:news1")
        .await
        .expect("read")
        .expect("encoded record");
    store.write_before_next_acquire("stream:news1", &encoded, Duration::from_secs(600));

    let record = resolver
        .resolve(&news1, &fixtures::channel_url("news1"), true)
        .await
        .expect("peer's record");

    assert_eq!(record.locator, "https://peer/live.m3u8");
    assert_eq!(tool.invocations(), 0);
    assert_eq!(observer.cache_misses(), 1);
    assert_eq!(observer.cache_hits(), 0);
    assert_eq!(observer.peer_results(), 1);
    assert_eq!(store.inner().get("lock:news1").await.expect("read"), None);
}

#[tokio::test]
async fn test_abandoned_lease_expires_on_its_own() {
    let store: Arc<dyn KeyedStore> = Arc::new(InMemoryStore::new());
    let lock = LeaseLock::new(store);
    let news1 = key("news1");

    let guard = match lock.acquire(&news1, Duration::from_millis(100)).await {
        LockAcquisition::Granted(guard) => guard,
        LockAcquisition::Denied => panic!("first acquire should be granted"),
    };
    // Simulate a crashed holder: never released.
    std::mem::forget(guard);

    assert!(!lock.acquire(&news1, Duration::from_secs(5)).await.is_granted());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(lock.acquire(&news1, Duration::from_secs(5)).await.is_granted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_short_lease_never_overlaps_tool_calls() {
    // The lease covers one call but not a second: every call is cut off at
    // 300ms, each attempt budgets 1.3s with the backstop, and the lease is 1.5s.
    let mut config = fixtures::fast_config();
    config.lock_lease = Duration::from_millis(1500);
    config.tool.socket_timeout = Duration::from_millis(100);
    config.tool.invocation_timeout = Duration::from_millis(300);
    config.retry = streamgate_test_utils::RetryPolicy {
        max_attempts: 5,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(10),
        multiplier: 1.0,
        jitter: false,
    };
    assert!(config.validate().is_err(), "such a lease must not pass validation");

    // Slower than the whole lease.
    let tool = Arc::new(fixtures::news1_tool().with_delay(Duration::from_secs(2)));
    let store = Arc::new(InMemoryStore::new());
    let first = Arc::new(StreamResolver::new(
        store.clone(),
        tool.clone(),
        Arc::new(RecordingObserver::new()),
        &config,
    ));
    let second = Arc::new(StreamResolver::new(
        store.clone(),
        tool.clone(),
        Arc::new(RecordingObserver::new()),
        &config,
    ));

    let early = tokio::spawn({
        let first = Arc::clone(&first);
        async move {
            first
                .resolve(&key("news1"), &fixtures::channel_url("news1"), true)
                .await
        }
    });
    let late = tokio::spawn({
        let second = Arc::clone(&second);
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            second
                .resolve(&key("news1"), &fixtures::channel_url("news1"), true)
                .await
        }
    });

    let early = early.await.expect("first task");
    let late = late.await.expect("second task");

    // The first holder stops before a second call could outlive the lease.
    assert_upstream_failed(&early, FailureCause::LeaseExhausted, 2);
    assert_busy(&late);
    assert_eq!(tool.invocations(), 1);
    assert_eq!(tool.max_in_flight(), 1);
    assert_eq!(store.get("lock:news1").await.expect("read"), None);
}

// ============================================================================
// RETRY AND THROTTLING
// ============================================================================

#[tokio::test]
async fn test_transient_failures_retry_up_to_max_attempts() {
    let h = harness(FakeTool::failing(fixtures::http_503()), fixtures::fast_config());

    let result = h
        .resolver
        .resolve(&key("news1"), &fixtures::channel_url("news1"), true)
        .await;

    assert_upstream_failed(&result, FailureCause::NonZeroExit, 3);
    assert_eq!(h.tool.invocations(), 3);
    assert_eq!(h.observer.failure_causes(), vec![FailureCause::NonZeroExit]);
    assert_eq!(h.store.get("stream:news1").await.expect("read"), None);
    assert_eq!(h.store.get("lock:news1").await.expect("read"), None);
}

#[tokio::test]
async fn test_offline_channel_is_not_retried() {
    let h = harness(FakeTool::failing(fixtures::not_live()), fixtures::fast_config());

    let result = h
        .resolver
        .resolve(&key("news1"), &fixtures::channel_url("news1"), true)
        .await;

    assert_unavailable(&result);
    assert_eq!(h.tool.invocations(), 1);
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let tool = fixtures::news1_tool().then(Err(fixtures::http_503()));
    let h = harness(tool, fixtures::fast_config());

    let record = h
        .resolver
        .resolve(&key("news1"), &fixtures::channel_url("news1"), true)
        .await
        .expect("second attempt succeeds");

    assert_eq!(record.locator, NEWS1_LOCATOR);
    assert_eq!(h.tool.invocations(), 2);
    let attempts = h
        .observer
        .count(|e| matches!(e, ResolutionEvent::AttemptFinished(_)));
    assert_eq!(attempts, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_throttler_bounds_concurrent_tool_calls() {
    let mut config = fixtures::fast_config();
    config.throttler_capacity = 2;
    let tool = fixtures::news1_tool().with_delay(Duration::from_millis(50));
    let h = harness(tool, config);

    let requests: Vec<ResolveRequest> = (1..=5)
        .map(|i| {
            let name = format!("news{}", i);
            ResolveRequest::new(key(&name), fixtures::channel_url(&name))
        })
        .collect();

    let outcome = h
        .resolver
        .resolve_many(&requests, true, Duration::from_secs(10))
        .await;

    assert_eq!(outcome.resolved.len(), 5);
    assert!(outcome.failed.is_empty());
    assert!(outcome.timed_out.is_empty());
    assert_eq!(h.tool.invocations(), 5);
    assert!(h.tool.max_in_flight() <= 2);
    assert_eq!(h.resolver.throttler().in_flight(), 0);
}

// ============================================================================
// BATCHES
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_timeout_reports_slow_keys_and_frees_lease() {
    let tool = fixtures::news1_tool().with_delay(Duration::from_millis(500));
    let h = harness(tool, fixtures::fast_config());
    let requests = vec![ResolveRequest::new(key("slow"), fixtures::channel_url("slow"))];

    let outcome = h
        .resolver
        .resolve_many(&requests, true, Duration::from_millis(100))
        .await;

    assert_eq!(outcome.timed_out, vec!["slow".to_string()]);
    assert_eq!(outcome.total(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.store.get("lock:slow").await.expect("read"), None);
}

#[tokio::test]
async fn test_batch_splits_outcomes_per_key() {
    let tool = fixtures::news1_tool();
    let h = harness(tool, fixtures::fast_config());
    h.store
        .set_with_ttl("lock:busy", b"1", Duration::from_secs(30))
        .await
        .expect("pre-set marker");

    let requests = vec![
        ResolveRequest::new(key("news1"), fixtures::channel_url("news1")),
        ResolveRequest::new(key("busy"), fixtures::channel_url("busy")),
        ResolveRequest::new(key("broken"), "not a url"),
    ];
    let outcome = h
        .resolver
        .resolve_many(&requests, true, Duration::from_secs(5))
        .await;

    assert!(outcome.resolved.contains_key("news1"));
    assert!(outcome.failed["busy"].is_busy());
    assert!(matches!(
        outcome.failed["broken"],
        streamgate_test_utils::ResolveError::UpstreamFailed {
            cause: FailureCause::InvalidInput,
            ..
        }
    ));
    assert_eq!(outcome.total(), 3);
}

// ============================================================================
// STORE FAILURES
// ============================================================================

#[tokio::test]
async fn test_unreadable_cache_fails_open() {
    let store = Arc::new(FlakyStore::new());
    let tool = Arc::new(fixtures::news1_tool());
    let resolver = StreamResolver::new(
        store.clone(),
        tool.clone(),
        Arc::new(RecordingObserver::new()),
        &fixtures::fast_config(),
    );

    store.fail_reads(true);
    for _ in 0..2 {
        resolver
            .resolve(&key("news1"), &fixtures::channel_url("news1"), true)
            .await
            .expect("resolves despite store reads failing");
    }
    assert_eq!(tool.invocations(), 2);
}

#[tokio::test]
async fn test_unacquirable_lock_is_busy_not_exclusive() {
    let store = Arc::new(FlakyStore::new());
    let tool = Arc::new(fixtures::news1_tool());
    let resolver = StreamResolver::new(
        store.clone(),
        tool.clone(),
        Arc::new(RecordingObserver::new()),
        &fixtures::fast_config(),
    );

    store.fail_acquire(true);
    let result = resolver
        .resolve(&key("news1"), &fixtures::channel_url("news1"), true)
        .await;
    assert_busy(&result);
    assert_eq!(tool.invocations(), 0);
}

#[tokio::test]
async fn test_cache_write_failure_still_returns_record() {
    let store = Arc::new(FlakyStore::new());
    let tool = Arc::new(fixtures::news1_tool());
    let observer = Arc::new(RecordingObserver::new());
    let resolver = StreamResolver::new(
        store.clone(),
        tool.clone(),
        observer.clone(),
        &fixtures::fast_config(),
    );

    store.fail_writes(true);
    let record = resolver
        .resolve(&key("news1"), &fixtures::channel_url("news1"), true)
        .await
        .expect("record returned even though it was not cached");
    assert_eq!(record.locator, NEWS1_LOCATOR);
    assert_eq!(
        observer.count(|e| matches!(e, ResolutionEvent::CacheWriteFailed { .. })),
        1
    );
    assert_eq!(store.inner().get("stream:news1").await.expect("read"), None);
    assert_eq!(LocatorCache::cache_key(&key("news1")), "stream:news1");
}
