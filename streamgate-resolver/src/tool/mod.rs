//! External resolution tool contract.
//!
//! A tool is a slow, blocking, single-shot call: give it a resource URL and
//! a hard timeout, get back a locator or a classified failure. The throttler
//! runs it on the blocking pool.

mod ytdlp;

pub use ytdlp::{parse_tool_output, YtDlpTool};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use streamgate_core::UpstreamError;

/// What a successful tool call reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub locator: String,
    pub attributes: BTreeMap<String, String>,
    /// Remaining validity advertised by the locator itself, if any.
    pub ttl_hint: Option<Duration>,
}

impl ToolOutput {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            attributes: BTreeMap::new(),
            ttl_hint: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_ttl_hint(mut self, ttl: Duration) -> Self {
        self.ttl_hint = Some(ttl);
        self
    }
}

/// A blocking external call that turns a resource URL into a locator.
///
/// Implementations must return within roughly `timeout`, terminating any
/// child process they started.
pub trait ExtractionTool: Send + Sync + 'static {
    fn invoke(&self, url: &str, timeout: Duration) -> Result<ToolOutput, UpstreamError>;
}

impl<T: ExtractionTool + ?Sized> ExtractionTool for Arc<T> {
    fn invoke(&self, url: &str, timeout: Duration) -> Result<ToolOutput, UpstreamError> {
        (**self).invoke(url, timeout)
    }
}
