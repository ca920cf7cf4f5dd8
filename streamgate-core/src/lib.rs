//! Streamgate Core - Data Types
//!
//! Pure data structures shared by every other streamgate crate: resolution
//! keys, cached locator records, lock leases, resolution attempts, the
//! failure taxonomy, and configuration. This crate performs no I/O.

pub mod config;
pub mod error;
pub mod locator;

use chrono::{DateTime, Utc};

pub use config::{
    ResolverConfig, RetryPolicy, ToolConfig, MAX_JITTER_FACTOR, MIN_JITTER_FACTOR,
    TOOL_BACKSTOP_GRACE,
};
pub use error::{
    ConfigError, FailureCause, ResolveError, StoreError, StreamgateError, StreamgateResult,
    UpstreamError, ValidationError,
};
pub use locator::{
    AttemptOutcome, LocatorRecord, LockLease, ResolutionAttempt, ResolutionKey,
    ATTR_FORMAT, ATTR_PROTOCOL, ATTR_QUALITY, ATTR_SOURCE,
};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;
