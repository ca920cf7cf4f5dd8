//! Process-wide bound on concurrent external tool calls.
//!
//! A slot is taken before the tool is launched and moves into the blocking
//! task, so it is held for exactly as long as the tool runs and is returned
//! on every exit path. Slots are taken per attempt; backoff sleeps between
//! attempts do not hold one.
//!
//! Under a lease, an attempt only launches if its full budget fits before
//! the lease deadline, so the tool is never running once the lease lapses.

use crate::backoff::{run_with_retry, Retried, RetryFailure};
use crate::tool::{ExtractionTool, ToolOutput};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use streamgate_core::{
    AttemptOutcome, LocatorRecord, ResolutionAttempt, ResolutionKey, ResolverConfig, RetryPolicy,
    UpstreamError,
};
use tokio::sync::Semaphore;
use tokio::time::Instant;

pub struct ResolutionThrottler {
    tool: Arc<dyn ExtractionTool>,
    permits: Arc<Semaphore>,
    capacity: usize,
    invocation_timeout: Duration,
    attempt_budget: Duration,
    ttl_ceiling: Duration,
    fallback_ttl: Duration,
}

impl ResolutionThrottler {
    pub fn new(tool: Arc<dyn ExtractionTool>, config: &ResolverConfig) -> Self {
        let capacity = config.throttler_capacity.max(1);
        Self {
            tool,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            invocation_timeout: config.tool.invocation_timeout,
            attempt_budget: config.tool.attempt_budget(),
            ttl_ceiling: config.cache_ttl_ceiling,
            fallback_ttl: config.fallback_ttl,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tool calls currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }

    /// One throttled tool call for `external_key`, parsed into a record.
    pub async fn resolve(&self, external_key: &str) -> Result<LocatorRecord, UpstreamError> {
        self.resolve_before(external_key, None).await
    }

    /// Longest a single call can keep the caller waiting, backstop included.
    pub fn attempt_budget(&self) -> Duration {
        self.attempt_budget
    }

    /// [`resolve`](Self::resolve), refusing to launch unless the call is
    /// certain to be over by `deadline`.
    pub async fn resolve_before(
        &self,
        external_key: &str,
        deadline: Option<Instant>,
    ) -> Result<LocatorRecord, UpstreamError> {
        validate_external_key(external_key)?;

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| UpstreamError::LaunchFailed {
                reason: "throttler is closed".to_string(),
            })?;

        // Checked after the wait for a slot, which can eat into the lease.
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < self.attempt_budget {
                tracing::warn!(
                    external_key,
                    remaining_ms = remaining.as_millis() as u64,
                    budget_ms = self.attempt_budget.as_millis() as u64,
                    "Lease too short for another tool call"
                );
                return Err(UpstreamError::LeaseExhausted { remaining });
            }
        }

        let tool = Arc::clone(&self.tool);
        let url = external_key.to_string();
        let timeout = self.invocation_timeout;
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            tool.invoke(&url, timeout)
        });

        let output = match tokio::time::timeout(self.attempt_budget, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_error)) => {
                return Err(UpstreamError::LaunchFailed {
                    reason: format!("tool task failed: {}", join_error),
                })
            }
            Err(_) => {
                tracing::warn!(external_key, "Tool overran its hard timeout");
                return Err(UpstreamError::Timeout { after: timeout });
            }
        };

        self.to_record(output)
    }

    /// [`resolve_before`](Self::resolve_before) under `policy`, reporting
    /// every attempt to `on_attempt`.
    pub async fn resolve_with_retry<F>(
        &self,
        key: &ResolutionKey,
        external_key: &str,
        policy: &RetryPolicy,
        deadline: Option<Instant>,
        on_attempt: F,
    ) -> Result<Retried<LocatorRecord>, RetryFailure<UpstreamError>>
    where
        F: Fn(ResolutionAttempt),
    {
        let on_attempt = &on_attempt;
        run_with_retry(policy, |attempt_number| async move {
            let attempt = ResolutionAttempt::start(key.as_str(), attempt_number);
            let result = self.resolve_before(external_key, deadline).await;
            let outcome = match &result {
                Ok(_) => AttemptOutcome::Succeeded,
                Err(e) => AttemptOutcome::Failed {
                    cause: e.cause(),
                    retryable: e.is_transient(),
                },
            };
            on_attempt(attempt.complete(outcome));
            result
        })
        .await
    }

    /// Validity is the tool's hint, or the fallback without one, never
    /// beyond the ceiling.
    fn record_ttl(&self, hint: Option<Duration>) -> Duration {
        hint.unwrap_or(self.fallback_ttl).min(self.ttl_ceiling)
    }

    fn to_record(&self, output: ToolOutput) -> Result<LocatorRecord, UpstreamError> {
        let ttl = self.record_ttl(output.ttl_hint);
        if ttl.is_zero() {
            return Err(UpstreamError::MalformedOutput {
                reason: "locator is already expired".to_string(),
            });
        }
        LocatorRecord::issue(output.locator, output.attributes, Utc::now(), ttl).map_err(|e| {
            UpstreamError::MalformedOutput {
                reason: e.to_string(),
            }
        })
    }
}

fn validate_external_key(external_key: &str) -> Result<(), UpstreamError> {
    if external_key.trim().is_empty() {
        return Err(UpstreamError::InvalidInput {
            reason: "external key is empty".to_string(),
        });
    }
    if external_key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(UpstreamError::InvalidInput {
            reason: format!("external key {:?} contains whitespace", external_key),
        });
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
