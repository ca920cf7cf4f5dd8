//! Resolver Configuration
//!
//! Values consumed by the resolution engine: cache TTL bounds, lock lease,
//! throttler capacity, retry policy, tool invocation and store timeouts.
//! Configuration is loaded from `STREAMGATE_*` environment variables with
//! defaults suitable for a single-node deployment.

use crate::error::{ConfigError, StreamgateError, StreamgateResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Smallest factor a jittered backoff delay is scaled by.
pub const MIN_JITTER_FACTOR: f64 = 0.5;
/// Largest factor a jittered backoff delay is scaled by.
pub const MAX_JITTER_FACTOR: f64 = 1.5;

/// Extra time the async side waits past the tool's hard timeout before
/// abandoning an invocation.
pub const TOOL_BACKSTOP_GRACE: Duration = Duration::from_secs(1);

/// Keyed store calls made while the lock is held: the lease write itself,
/// the post-grant cache re-check and the write-back.
const STORE_CALLS_UNDER_LOCK: u32 = 3;

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Bounded exponential backoff with optional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Scale each delay by a uniform factor in `[0.5, 1.5]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows the failed attempt
    /// `attempt_index` (0-based), before jitter:
    /// `min(max_delay, initial_delay * multiplier^attempt_index)`.
    pub fn base_delay(&self, attempt_index: u32) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Upper bound on the total backoff sleep across all retries,
    /// jitter included.
    pub fn max_total_backoff(&self) -> Duration {
        let factor = if self.jitter { MAX_JITTER_FACTOR } else { 1.0 };
        let retries = self.max_attempts.saturating_sub(1);
        let mut total = Duration::ZERO;
        for index in 0..retries {
            let delay = self.base_delay(index).mul_f64(factor).min(self.max_delay);
            if delay == self.max_delay {
                // Every later delay is capped too.
                let rest = self
                    .max_delay
                    .checked_mul(retries - index)
                    .unwrap_or(Duration::MAX);
                return total.saturating_add(rest);
            }
            total = total.saturating_add(delay);
        }
        total
    }

    fn validate(&self) -> StreamgateResult<()> {
        if self.max_attempts == 0 {
            return Err(invalid(
                "retry.max_attempts",
                self.max_attempts.to_string(),
                "max_attempts must be at least 1",
            ));
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(invalid(
                "retry.multiplier",
                self.multiplier.to_string(),
                "multiplier must be a finite value >= 1.0",
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(invalid(
                "retry.initial_delay",
                format!("{:?}", self.initial_delay),
                "initial_delay must not exceed max_delay",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TOOL CONFIGURATION
// ============================================================================

/// Invocation settings for the external resolution tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Executable name or path.
    pub binary: String,
    /// Format selector passed to the tool.
    pub format: String,
    pub proxy: Option<String>,
    /// Timeout hint handed to the tool itself.
    pub socket_timeout: Duration,
    /// Hard bound after which the invocation is force-terminated.
    pub invocation_timeout: Duration,
}

impl ToolConfig {
    /// Longest a single attempt can keep the caller waiting.
    pub fn attempt_budget(&self) -> Duration {
        self.invocation_timeout.saturating_add(TOOL_BACKSTOP_GRACE)
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            format: "best".to_string(),
            proxy: None,
            socket_timeout: Duration::from_secs(30),
            invocation_timeout: Duration::from_secs(35),
        }
    }
}

// ============================================================================
// RESOLVER CONFIGURATION
// ============================================================================

/// Configuration for the stream resolution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Upper bound on how long any record stays cached.
    pub cache_ttl_ceiling: Duration,
    /// Validity assumed when the tool gives no expiry hint.
    pub fallback_ttl: Duration,
    /// Must outlast the whole locked section, see
    /// [`ResolverConfig::max_locked_section`].
    pub lock_lease: Duration,
    /// Total wait after a lock denial before reporting `Busy`.
    pub contention_wait: Duration,
    /// Cache re-checks spread across `contention_wait`.
    pub contention_polls: u32,
    pub throttler_capacity: usize,
    pub retry: RetryPolicy,
    pub tool: ToolConfig,
    /// Client-side bound on every keyed store call.
    pub store_timeout: Duration,
    /// Redis connection string; the in-memory store is used when absent.
    pub redis_url: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ceiling: Duration::from_secs(21_600), // 6 hours
            fallback_ttl: Duration::from_secs(3_000),
            lock_lease: Duration::from_secs(150),
            contention_wait: Duration::from_secs(2),
            contention_polls: 1,
            throttler_capacity: 3,
            retry: RetryPolicy::default(),
            tool: ToolConfig::default(),
            store_timeout: Duration::from_secs(5),
            redis_url: None,
        }
    }
}

impl ResolverConfig {
    /// Create ResolverConfig from environment variables.
    ///
    /// Environment variables (unset or unparsable values keep the default):
    /// - `STREAMGATE_CACHE_TTL_SECS`: Cache TTL ceiling (default: 21600)
    /// - `STREAMGATE_FALLBACK_TTL_SECS`: TTL without an expiry hint (default: 3000)
    /// - `STREAMGATE_LOCK_LEASE_SECS`: Lock lease duration (default: 150)
    /// - `STREAMGATE_CONTENTION_WAIT_MS`: Wait after lock denial (default: 2000)
    /// - `STREAMGATE_CONTENTION_POLLS`: Cache re-checks during that wait (default: 1)
    /// - `STREAMGATE_MAX_CONCURRENT_RESOLUTIONS`: Throttler capacity (default: 3)
    /// - `STREAMGATE_RETRY_MAX_ATTEMPTS`: Attempts per resolution (default: 3)
    /// - `STREAMGATE_RETRY_INITIAL_DELAY_MS`: First backoff delay (default: 1000)
    /// - `STREAMGATE_RETRY_MAX_DELAY_MS`: Backoff ceiling (default: 30000)
    /// - `STREAMGATE_RETRY_MULTIPLIER`: Backoff multiplier (default: 2.0)
    /// - `STREAMGATE_RETRY_JITTER`: "true" or "false" (default: true)
    /// - `STREAMGATE_TOOL_BINARY`: Tool executable (default: yt-dlp)
    /// - `STREAMGATE_TOOL_FORMAT`: Format selector (default: best)
    /// - `STREAMGATE_TOOL_PROXY`: Proxy handed to the tool (default: none)
    /// - `STREAMGATE_TOOL_SOCKET_TIMEOUT_SECS`: Tool's own timeout (default: 30)
    /// - `STREAMGATE_TOOL_TIMEOUT_SECS`: Hard invocation timeout (default: 35)
    /// - `STREAMGATE_STORE_TIMEOUT_MS`: Keyed store call timeout (default: 5000)
    /// - `STREAMGATE_REDIS_URL`: Redis connection string (default: none)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let retry = RetryPolicy {
            max_attempts: env_parse("STREAMGATE_RETRY_MAX_ATTEMPTS")
                .unwrap_or(defaults.retry.max_attempts),
            initial_delay: env_millis("STREAMGATE_RETRY_INITIAL_DELAY_MS")
                .unwrap_or(defaults.retry.initial_delay),
            max_delay: env_millis("STREAMGATE_RETRY_MAX_DELAY_MS")
                .unwrap_or(defaults.retry.max_delay),
            multiplier: env_parse("STREAMGATE_RETRY_MULTIPLIER")
                .unwrap_or(defaults.retry.multiplier),
            jitter: std::env::var("STREAMGATE_RETRY_JITTER")
                .ok()
                .map(|s| s.to_lowercase() != "false")
                .unwrap_or(defaults.retry.jitter),
        };

        let tool = ToolConfig {
            binary: env_string("STREAMGATE_TOOL_BINARY").unwrap_or(defaults.tool.binary),
            format: env_string("STREAMGATE_TOOL_FORMAT").unwrap_or(defaults.tool.format),
            proxy: env_string("STREAMGATE_TOOL_PROXY"),
            socket_timeout: env_secs("STREAMGATE_TOOL_SOCKET_TIMEOUT_SECS")
                .unwrap_or(defaults.tool.socket_timeout),
            invocation_timeout: env_secs("STREAMGATE_TOOL_TIMEOUT_SECS")
                .unwrap_or(defaults.tool.invocation_timeout),
        };

        Self {
            cache_ttl_ceiling: env_secs("STREAMGATE_CACHE_TTL_SECS")
                .unwrap_or(defaults.cache_ttl_ceiling),
            fallback_ttl: env_secs("STREAMGATE_FALLBACK_TTL_SECS")
                .unwrap_or(defaults.fallback_ttl),
            lock_lease: env_secs("STREAMGATE_LOCK_LEASE_SECS").unwrap_or(defaults.lock_lease),
            contention_wait: env_millis("STREAMGATE_CONTENTION_WAIT_MS")
                .unwrap_or(defaults.contention_wait),
            contention_polls: env_parse("STREAMGATE_CONTENTION_POLLS")
                .unwrap_or(defaults.contention_polls),
            throttler_capacity: env_parse("STREAMGATE_MAX_CONCURRENT_RESOLUTIONS")
                .unwrap_or(defaults.throttler_capacity),
            retry,
            tool,
            store_timeout: env_millis("STREAMGATE_STORE_TIMEOUT_MS")
                .unwrap_or(defaults.store_timeout),
            redis_url: env_string("STREAMGATE_REDIS_URL"),
        }
    }

    /// Worst-case time the lock is held by one resolution: every attempt
    /// running to its hard timeout, every backoff at its jittered maximum,
    /// and every store call under the lock at its timeout.
    pub fn max_locked_section(&self) -> Duration {
        let attempts = self.retry.max_attempts.max(1);
        let tool_time = self
            .tool
            .attempt_budget()
            .checked_mul(attempts)
            .unwrap_or(Duration::MAX);
        let store_time = self
            .store_timeout
            .checked_mul(STORE_CALLS_UNDER_LOCK)
            .unwrap_or(Duration::MAX);
        tool_time
            .saturating_add(self.retry.max_total_backoff())
            .saturating_add(store_time)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - all durations are positive
    /// - throttler_capacity >= 1 and contention_polls >= 1
    /// - fallback_ttl <= cache_ttl_ceiling
    /// - tool.invocation_timeout > tool.socket_timeout
    /// - the retry policy is bounded and non-shrinking
    /// - lock_lease > max_locked_section, so a lease never lapses while its
    ///   holder can still launch or be running the tool
    pub fn validate(&self) -> StreamgateResult<()> {
        for (field, value) in [
            ("cache_ttl_ceiling", self.cache_ttl_ceiling),
            ("fallback_ttl", self.fallback_ttl),
            ("lock_lease", self.lock_lease),
            ("contention_wait", self.contention_wait),
            ("store_timeout", self.store_timeout),
            ("tool.socket_timeout", self.tool.socket_timeout),
            ("tool.invocation_timeout", self.tool.invocation_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(
                    field,
                    format!("{:?}", value),
                    format!("{} must be positive", field),
                ));
            }
        }

        if self.throttler_capacity == 0 {
            return Err(invalid(
                "throttler_capacity",
                self.throttler_capacity.to_string(),
                "throttler_capacity must be at least 1",
            ));
        }

        if self.contention_polls == 0 {
            return Err(invalid(
                "contention_polls",
                self.contention_polls.to_string(),
                "contention_polls must be at least 1",
            ));
        }

        if self.fallback_ttl > self.cache_ttl_ceiling {
            return Err(invalid(
                "fallback_ttl",
                format!("{:?}", self.fallback_ttl),
                "fallback_ttl must not exceed cache_ttl_ceiling",
            ));
        }

        if self.tool.invocation_timeout <= self.tool.socket_timeout {
            return Err(invalid(
                "tool.invocation_timeout",
                format!("{:?}", self.tool.invocation_timeout),
                "invocation_timeout must be greater than socket_timeout",
            ));
        }

        if self.tool.binary.trim().is_empty() {
            return Err(StreamgateError::Config(ConfigError::MissingRequired {
                field: "tool.binary".to_string(),
            }));
        }

        self.retry.validate()?;

        let locked_section = self.max_locked_section();
        if self.lock_lease <= locked_section {
            return Err(invalid(
                "lock_lease",
                format!("{:?}", self.lock_lease),
                format!(
                    "lock_lease must exceed the worst-case locked section of {:?}",
                    locked_section
                ),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: String, reason: impl Into<String>) -> StreamgateError {
    StreamgateError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.into(),
    })
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|s| s.parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// The un-jittered delay never exceeds max_delay and never shrinks.
        #[test]
        fn prop_base_delay_bounded_and_monotone(
            initial_ms in 1u64..5_000,
            extra_ms in 0u64..60_000,
            multiplier in 1.0f64..4.0,
            attempt in 0u32..64,
        ) {
            let policy = RetryPolicy {
                max_attempts: 5,
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(initial_ms + extra_ms),
                multiplier,
                jitter: false,
            };
            let current = policy.base_delay(attempt);
            let next = policy.base_delay(attempt + 1);
            prop_assert!(current <= policy.max_delay);
            prop_assert!(next >= current);
        }

        /// A config that validates never lets the lease lapse mid-resolution.
        #[test]
        fn prop_valid_config_lease_covers_locked_section(
            lease_secs in 1u64..600,
            attempts in 1u32..6,
            timeout_secs in 2u64..60,
        ) {
            let mut config = ResolverConfig {
                lock_lease: Duration::from_secs(lease_secs),
                ..ResolverConfig::default()
            };
            config.retry.max_attempts = attempts;
            config.tool.socket_timeout = Duration::from_secs(timeout_secs - 1);
            config.tool.invocation_timeout = Duration::from_secs(timeout_secs);

            if config.validate().is_ok() {
                let budget = config.tool.attempt_budget() * attempts;
                prop_assert!(config.lock_lease > budget);
            }
        }

        /// Zero capacity is rejected regardless of the other fields.
        #[test]
        fn prop_config_rejects_invalid_capacity(polls in 1u32..10) {
            let config = ResolverConfig {
                throttler_capacity: 0,
                contention_polls: polls,
                ..ResolverConfig::default()
            };
            let result = config.validate();
            let is_capacity_error = matches!(
                result,
                Err(StreamgateError::Config(ConfigError::InvalidValue { ref field, .. })) if field == "throttler_capacity"
            );
            prop_assert!(is_capacity_error);
        }
    }
}
