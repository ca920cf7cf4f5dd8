//! Prometheus Metrics
//!
//! Resolution, cache and lock metrics registered once in the default
//! registry. [`MetricsObserver`] feeds them from resolution events and
//! [`encode_metrics`] renders the text exposition format.

use crate::error::{TelemetryError, TelemetryResult};
use crate::observer::{ResolutionEvent, ResolutionObserver};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use streamgate_core::AttemptOutcome;

/// Resolution latency buckets (seconds); the tool typically takes seconds.
const RESOLUTION_LATENCY_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 30.0];

/// Global metrics instance - initialized on first use
pub static METRICS: Lazy<TelemetryResult<ResolverMetrics>> = Lazy::new(ResolverMetrics::new);

/// Container for all streamgate metrics.
#[derive(Clone)]
pub struct ResolverMetrics {
    /// Resolutions by outcome - labels: key, status
    pub resolutions_total: CounterVec,

    /// Failed resolutions - labels: key, cause
    pub resolution_errors_total: CounterVec,

    /// End-to-end resolution duration - labels: key
    pub resolution_duration_seconds: HistogramVec,

    /// Individual tool attempts - labels: outcome
    pub resolution_attempts_total: CounterVec,

    pub cache_hits_total: Counter,
    pub cache_misses_total: Counter,

    /// hits / (hits + misses) since process start
    pub cache_hit_rate: Gauge,

    /// Misses served by a record another resolver wrote meanwhile
    pub peer_results_total: Counter,

    pub lock_contention_total: Counter,
    pub cache_write_failures_total: Counter,
}

fn registration(name: &'static str) -> impl FnOnce(prometheus::Error) -> TelemetryError {
    move |e| TelemetryError::MetricRegistration {
        name,
        reason: e.to_string(),
    }
}

impl ResolverMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> TelemetryResult<Self> {
        Ok(Self {
            resolutions_total: register_counter_vec!(
                "streamgate_resolutions_total",
                "Total stream resolutions by outcome",
                &["key", "status"]
            )
            .map_err(registration("streamgate_resolutions_total"))?,

            resolution_errors_total: register_counter_vec!(
                "streamgate_resolution_errors_total",
                "Failed stream resolutions by classified cause",
                &["key", "cause"]
            )
            .map_err(registration("streamgate_resolution_errors_total"))?,

            resolution_duration_seconds: register_histogram_vec!(
                "streamgate_resolution_duration_seconds",
                "Stream resolution duration in seconds",
                &["key"],
                RESOLUTION_LATENCY_BUCKETS.to_vec()
            )
            .map_err(registration("streamgate_resolution_duration_seconds"))?,

            resolution_attempts_total: register_counter_vec!(
                "streamgate_resolution_attempts_total",
                "Individual resolution tool attempts by outcome",
                &["outcome"]
            )
            .map_err(registration("streamgate_resolution_attempts_total"))?,

            cache_hits_total: register_counter!(
                "streamgate_cache_hits_total",
                "Total locator cache hits"
            )
            .map_err(registration("streamgate_cache_hits_total"))?,

            cache_misses_total: register_counter!(
                "streamgate_cache_misses_total",
                "Total locator cache misses"
            )
            .map_err(registration("streamgate_cache_misses_total"))?,

            cache_hit_rate: register_gauge!(
                "streamgate_cache_hit_rate",
                "Locator cache hit rate"
            )
            .map_err(registration("streamgate_cache_hit_rate"))?,

            peer_results_total: register_counter!(
                "streamgate_peer_results_total",
                "Cache misses answered by a record another resolver wrote"
            )
            .map_err(registration("streamgate_peer_results_total"))?,

            lock_contention_total: register_counter!(
                "streamgate_lock_contention_total",
                "Resolutions that found the per-key lock already held"
            )
            .map_err(registration("streamgate_lock_contention_total"))?,

            cache_write_failures_total: register_counter!(
                "streamgate_cache_write_failures_total",
                "Resolved records that could not be written to the cache"
            )
            .map_err(registration("streamgate_cache_write_failures_total"))?,
        })
    }

    fn refresh_hit_rate(&self) {
        let hits = self.cache_hits_total.get();
        let total = hits + self.cache_misses_total.get();
        if total > 0.0 {
            self.cache_hit_rate.set(hits / total);
        }
    }

    /// Apply one resolution event.
    pub fn record(&self, event: &ResolutionEvent) {
        match event {
            ResolutionEvent::CacheHit { .. } => {
                self.cache_hits_total.inc();
                self.refresh_hit_rate();
            }
            ResolutionEvent::CacheMiss { .. } => {
                self.cache_misses_total.inc();
                self.refresh_hit_rate();
            }
            ResolutionEvent::PeerResultUsed { .. } => self.peer_results_total.inc(),
            ResolutionEvent::LockContention { .. } => self.lock_contention_total.inc(),
            ResolutionEvent::AttemptFinished(attempt) => {
                let outcome = match attempt.outcome {
                    AttemptOutcome::Succeeded => "success",
                    AttemptOutcome::Failed { cause, .. } => cause.as_label(),
                    AttemptOutcome::InFlight => return,
                };
                self.resolution_attempts_total
                    .with_label_values(&[outcome])
                    .inc();
            }
            ResolutionEvent::ResolutionSucceeded { key, duration, .. } => {
                self.resolutions_total
                    .with_label_values(&[key.as_str(), "success"])
                    .inc();
                self.resolution_duration_seconds
                    .with_label_values(&[key.as_str()])
                    .observe(duration.as_secs_f64());
            }
            ResolutionEvent::ResolutionFailed {
                key,
                cause,
                duration,
                ..
            } => {
                self.resolutions_total
                    .with_label_values(&[key.as_str(), "error"])
                    .inc();
                self.resolution_errors_total
                    .with_label_values(&[key.as_str(), cause.as_label()])
                    .inc();
                self.resolution_duration_seconds
                    .with_label_values(&[key.as_str()])
                    .observe(duration.as_secs_f64());
            }
            ResolutionEvent::CacheWriteFailed { .. } => self.cache_write_failures_total.inc(),
        }
    }
}

/// Observer that records events into [`METRICS`].
#[derive(Clone, Copy)]
pub struct MetricsObserver {
    metrics: &'static ResolverMetrics,
}

impl MetricsObserver {
    pub fn new() -> TelemetryResult<Self> {
        let metrics = METRICS.as_ref().map_err(Clone::clone)?;
        Ok(Self { metrics })
    }

    pub fn metrics(&self) -> &'static ResolverMetrics {
        self.metrics
    }
}

impl ResolutionObserver for MetricsObserver {
    fn observe(&self, event: &ResolutionEvent) {
        self.metrics.record(event);
    }
}

/// Render every registered metric in the Prometheus text format.
pub fn encode_metrics() -> TelemetryResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::Encode(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::Encode(e.to_string()))
}
