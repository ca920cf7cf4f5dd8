//! Error types for streamgate operations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Keyed store errors.
///
/// Callers decide what a store failure means: cache reads treat it as a
/// miss, lock acquisition treats it as denied, cache writes log and move on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable during {operation}: {reason}")]
    Unavailable {
        operation: &'static str,
        reason: String,
    },

    #[error("Store {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Stored value for {key} could not be decoded: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Refusing to write {key} with an empty TTL")]
    InvalidTtl { key: String },
}

/// Classified cause of a failed resolution attempt.
///
/// The label is stable and used verbatim in metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Timeout,
    NonZeroExit,
    MalformedOutput,
    LaunchFailed,
    NoLocator,
    InvalidInput,
    LeaseExhausted,
}

impl FailureCause {
    pub fn as_label(&self) -> &'static str {
        match self {
            FailureCause::Timeout => "timeout",
            FailureCause::NonZeroExit => "non_zero_exit",
            FailureCause::MalformedOutput => "malformed_output",
            FailureCause::LaunchFailed => "launch_failed",
            FailureCause::NoLocator => "no_locator",
            FailureCause::InvalidInput => "invalid_input",
            FailureCause::LeaseExhausted => "lease_exhausted",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Errors raised by a single call into the external resolution tool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("Resolution tool timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Resolution tool exited with status {status:?}: {stderr}")]
    NonZeroExit { status: Option<i32>, stderr: String },

    #[error("Resolution tool produced malformed output: {reason}")]
    MalformedOutput { reason: String },

    #[error("Resolution tool could not be launched: {reason}")]
    LaunchFailed { reason: String },

    #[error("No locator present: {reason}")]
    ResourceUnavailable { reason: String },

    #[error("Invalid resolution input: {reason}")]
    InvalidInput { reason: String },

    /// Not enough of the lock lease is left to cover another attempt.
    #[error("Lock lease has {remaining:?} left, less than one attempt needs")]
    LeaseExhausted { remaining: Duration },
}

impl UpstreamError {
    /// Whether the backoff executor may retry after this error.
    ///
    /// `ResourceUnavailable` is a legitimate terminal miss, `InvalidInput`
    /// will fail the same way on every attempt, and `LeaseExhausted` only
    /// gets worse as the lease runs down.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            UpstreamError::ResourceUnavailable { .. }
                | UpstreamError::InvalidInput { .. }
                | UpstreamError::LeaseExhausted { .. }
        )
    }

    pub fn cause(&self) -> FailureCause {
        match self {
            UpstreamError::Timeout { .. } => FailureCause::Timeout,
            UpstreamError::NonZeroExit { .. } => FailureCause::NonZeroExit,
            UpstreamError::MalformedOutput { .. } => FailureCause::MalformedOutput,
            UpstreamError::LaunchFailed { .. } => FailureCause::LaunchFailed,
            UpstreamError::ResourceUnavailable { .. } => FailureCause::NoLocator,
            UpstreamError::InvalidInput { .. } => FailureCause::InvalidInput,
            UpstreamError::LeaseExhausted { .. } => FailureCause::LeaseExhausted,
        }
    }
}

/// The only failures the stream resolver surfaces to its callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Resource {key} is unavailable: {reason}")]
    ResourceUnavailable { key: String, reason: String },

    #[error("Resolution of {key} is already in progress, retry shortly")]
    Busy { key: String },

    #[error("Upstream resolution of {key} failed after {attempts} attempt(s) ({cause}): {reason}")]
    UpstreamFailed {
        key: String,
        cause: FailureCause,
        attempts: u32,
        reason: String,
    },
}

impl ResolveError {
    /// The resolution key this failure belongs to.
    pub fn key(&self) -> &str {
        match self {
            ResolveError::ResourceUnavailable { key, .. }
            | ResolveError::Busy { key }
            | ResolveError::UpstreamFailed { key, .. } => key,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, ResolveError::Busy { .. })
    }

    /// Build the caller-facing failure from the last upstream error.
    pub fn from_upstream(key: &str, error: &UpstreamError, attempts: u32) -> Self {
        match error {
            UpstreamError::ResourceUnavailable { reason } => ResolveError::ResourceUnavailable {
                key: key.to_string(),
                reason: reason.clone(),
            },
            other => ResolveError::UpstreamFailed {
                key: key.to_string(),
                cause: other.cause(),
                attempts,
                reason: other.to_string(),
            },
        }
    }
}

/// Validation errors for keys and locator records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Resolution key must not be empty")]
    EmptyKey,

    #[error("Invalid resolution key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Locator must not be empty")]
    EmptyLocator,

    #[error("Locator expiry {expires_at} is not after issue time {issued_at}")]
    InvalidValidity {
        issued_at: String,
        expires_at: String,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all streamgate errors.
#[derive(Debug, Clone, Error)]
pub enum StreamgateError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for streamgate operations.
pub type StreamgateResult<T> = Result<T, StreamgateError>;

// =============================================================================
// TESTS
// =============================================================================
