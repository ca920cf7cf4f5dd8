//! Errors raised while bootstrapping telemetry.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TelemetryError {
    #[error("Failed to register metric {name}: {reason}")]
    MetricRegistration { name: &'static str, reason: String },

    #[error("Failed to encode metrics: {0}")]
    Encode(String),

    #[error("Failed to init subscriber: {0}")]
    Subscriber(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
