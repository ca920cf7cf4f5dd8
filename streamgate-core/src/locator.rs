//! Resolution keys, locator records, lock leases and resolution attempts.

use crate::error::{FailureCause, ValidationError};
use crate::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Attribute name for the quality label reported by the tool.
pub const ATTR_QUALITY: &str = "quality";
/// Attribute name for the container format (`hls` or `dash`).
pub const ATTR_FORMAT: &str = "format";
/// Attribute name for the locator transport (`http` or `https`).
pub const ATTR_PROTOCOL: &str = "protocol";
/// Attribute name for the upstream-facing identifier the locator came from.
pub const ATTR_SOURCE: &str = "source";

const MAX_KEY_LEN: usize = 256;

// ============================================================================
// RESOLUTION KEY
// ============================================================================

/// Stable identity of a logical resource, e.g. a channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResolutionKey(String);

impl ResolutionKey {
    /// Validate and wrap a key.
    ///
    /// Keys must be non-blank, at most 256 bytes, and free of control
    /// characters so they can be embedded in store keys verbatim.
    pub fn new(key: impl Into<String>) -> Result<Self, ValidationError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        if key.len() > MAX_KEY_LEN {
            return Err(ValidationError::InvalidKey {
                reason: format!("longer than {} bytes", MAX_KEY_LEN),
                key,
            });
        }
        if key.chars().any(char::is_control) {
            return Err(ValidationError::InvalidKey {
                key,
                reason: "contains control characters".to_string(),
            });
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResolutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResolutionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ResolutionKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ResolutionKey> for String {
    fn from(key: ResolutionKey) -> Self {
        key.0
    }
}

// ============================================================================
// LOCATOR RECORD
// ============================================================================

/// A short-lived resource locator together with its validity window.
///
/// Invariant: `expires_at > issued_at`. A record past `expires_at` is never
/// served, whether or not the store has evicted it yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorRecord {
    pub locator: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
}

impl LocatorRecord {
    pub fn new(
        locator: impl Into<String>,
        attributes: BTreeMap<String, String>,
        issued_at: Timestamp,
        expires_at: Timestamp,
    ) -> Result<Self, ValidationError> {
        let locator = locator.into();
        if locator.trim().is_empty() {
            return Err(ValidationError::EmptyLocator);
        }
        if expires_at <= issued_at {
            return Err(ValidationError::InvalidValidity {
                issued_at: issued_at.to_rfc3339(),
                expires_at: expires_at.to_rfc3339(),
            });
        }
        Ok(Self {
            locator,
            attributes,
            issued_at,
            expires_at,
        })
    }

    /// Create a record valid for `validity` starting at `issued_at`.
    pub fn issue(
        locator: impl Into<String>,
        attributes: BTreeMap<String, String>,
        issued_at: Timestamp,
        validity: Duration,
    ) -> Result<Self, ValidationError> {
        let validity = chrono::Duration::from_std(validity).map_err(|_| {
            ValidationError::InvalidValidity {
                issued_at: issued_at.to_rfc3339(),
                expires_at: "out of range".to_string(),
            }
        })?;
        Self::new(locator, attributes, issued_at, issued_at + validity)
    }

    /// Check the record invariant; deserialized records bypass `new`.
    pub fn is_well_formed(&self) -> bool {
        !self.locator.trim().is_empty() && self.expires_at > self.issued_at
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left before expiry, or `None` once expired.
    pub fn remaining_ttl(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired_at(now) {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    /// The declared validity window (`expires_at - issued_at`).
    pub fn validity(&self) -> Duration {
        (self.expires_at - self.issued_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

// ============================================================================
// LOCK LEASE
// ============================================================================

/// A granted per-key lock, valid until `held_until` unless released sooner.
///
/// The store only records presence; the lease itself carries no payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub key: String,
    pub held_until: Timestamp,
}

impl LockLease {
    pub fn new(key: impl Into<String>, acquired_at: Timestamp, lease: Duration) -> Self {
        let held_until = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| acquired_at.checked_add_signed(lease))
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
        Self {
            key: key.into(),
            held_until,
        }
    }

    /// Check if the lease has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.held_until
    }

    /// Calculate remaining duration until expiry.
    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if now >= self.held_until {
            None
        } else {
            (self.held_until - now).to_std().ok()
        }
    }
}

// ============================================================================
// RESOLUTION ATTEMPT
// ============================================================================

/// Outcome of one throttled call into the external tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum AttemptOutcome {
    InFlight,
    Succeeded,
    Failed { cause: FailureCause, retryable: bool },
}

/// Ephemeral telemetry for a single attempt; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionAttempt {
    pub attempt_id: Uuid,
    pub key: String,
    pub started_at: Timestamp,
    /// 1-based.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

impl ResolutionAttempt {
    pub fn start(key: impl Into<String>, attempt_number: u32) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            key: key.into(),
            started_at: Utc::now(),
            attempt_number,
            outcome: AttemptOutcome::InFlight,
            elapsed: Duration::ZERO,
        }
    }

    pub fn complete(mut self, outcome: AttemptOutcome) -> Self {
        self.elapsed = (Utc::now() - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.outcome = outcome;
        self
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Succeeded)
    }
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
