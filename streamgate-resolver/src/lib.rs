//! Streamgate Resolver - Cache-Aside Stream Resolution
//!
//! Fronts a slow, rate-limited resolution tool (`yt-dlp`) with:
//!
//! - a TTL-bounded locator cache ([`streamgate_storage::LocatorCache`])
//! - a per-key lease lock that collapses concurrent misses into one call
//! - a process-wide throttler bounding concurrent tool invocations
//! - bounded exponential backoff for transient tool failures
//!
//! [`StreamResolver`] ties these together; observers receive resolution
//! events for logging and Prometheus metrics.

pub mod backoff;
pub mod error;
pub mod metrics;
pub mod observer;
pub mod resolver;
pub mod telemetry;
pub mod throttler;
pub mod tool;

pub use backoff::{backoff_delay, run_with_retry, Retried, RetryFailure, Retryable};
pub use error::{TelemetryError, TelemetryResult};
pub use metrics::{encode_metrics, MetricsObserver, ResolverMetrics, METRICS};
pub use observer::{
    CompositeObserver, NoopObserver, ResolutionEvent, ResolutionObserver, TracingObserver,
};
pub use resolver::{connect_store, BatchOutcome, ResolveRequest, StreamResolver};
pub use telemetry::{init_tracing, LogFormat};
pub use throttler::ResolutionThrottler;
pub use tool::{parse_tool_output, ExtractionTool, ToolOutput, YtDlpTool};

pub use streamgate_core::{
    FailureCause, LocatorRecord, ResolutionKey, ResolveError, ResolverConfig, RetryPolicy,
    UpstreamError,
};
