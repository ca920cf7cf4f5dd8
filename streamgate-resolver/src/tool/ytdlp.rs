//! `yt-dlp` subprocess tool.
//!
//! The child runs on tokio's process driver. `invoke` is called from a
//! blocking task, so it drives the async call on the current runtime's
//! handle, or on a private runtime when there is none.

use super::{ExtractionTool, ToolOutput};
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::process::Stdio;
use std::time::{Duration, Instant};
use streamgate_core::{ToolConfig, UpstreamError, ATTR_FORMAT, ATTR_PROTOCOL, ATTR_QUALITY, ATTR_SOURCE};
use tokio::process::Command;
use tokio::runtime::{Builder, Handle};
use url::Url;

const STDERR_EXCERPT: usize = 512;

/// stderr fragments meaning the resource has no stream right now.
const UNAVAILABLE_MARKERS: &[&str] = &[
    "is not currently live",
    "this live event will begin",
    "premieres in",
    "video unavailable",
    "this channel does not exist",
    "does not have a live stream",
];

/// Resolves live stream locators by running `yt-dlp -j`.
#[derive(Debug, Clone)]
pub struct YtDlpTool {
    config: ToolConfig,
}

impl YtDlpTool {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// Arguments for one resolution of `url`.
    pub fn command_args(&self, url: &str) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            self.config.format.clone(),
            "-j".to_string(),
            "--socket-timeout".to_string(),
            self.config.socket_timeout.as_secs().max(1).to_string(),
            "--no-warnings".to_string(),
            "-q".to_string(),
        ];
        if let Some(proxy) = &self.config.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        args.push(url.to_string());
        args
    }

    /// Run `<binary> --version`; used as a startup probe.
    pub fn version(&self) -> Result<String, UpstreamError> {
        let captured = self.run(&["--version".to_string()], Duration::from_secs(10))?;
        if !captured.success {
            return Err(UpstreamError::NonZeroExit {
                status: captured.status,
                stderr: excerpt(&captured.stderr),
            });
        }
        let version = captured.stdout.trim().to_string();
        if version.is_empty() {
            return Err(UpstreamError::MalformedOutput {
                reason: "empty version output".to_string(),
            });
        }
        Ok(version)
    }

    fn run(&self, args: &[String], timeout: Duration) -> Result<Captured, UpstreamError> {
        block_on(self.run_async(args, timeout))?
    }

    async fn run_async(&self, args: &[String], timeout: Duration) -> Result<Captured, UpstreamError> {
        // kill_on_drop covers the timeout: dropping the wait future kills the
        // child and the runtime reaps it, so no zombie is left behind.
        let child = Command::new(&self.config.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| UpstreamError::LaunchFailed {
                reason: format!("{}: {}", self.config.binary, e),
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(UpstreamError::LaunchFailed {
                    reason: format!("waiting on child failed: {}", e),
                })
            }
            Err(_) => {
                tracing::warn!(
                    binary = %self.config.binary,
                    timeout_ms = timeout.as_millis() as u64,
                    "Tool timed out, killing child"
                );
                return Err(UpstreamError::Timeout { after: timeout });
            }
        };

        Ok(Captured {
            success: output.status.success(),
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

struct Captured {
    success: bool,
    status: Option<i32>,
    stdout: String,
    stderr: String,
}

/// Drive `future` from synchronous code. Must not be called on a runtime
/// worker thread; blocking tasks and plain threads are fine.
fn block_on<F: Future>(future: F) -> Result<F::Output, UpstreamError> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => {
            let runtime = Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| UpstreamError::LaunchFailed {
                    reason: format!("no runtime for the tool: {}", e),
                })?;
            Ok(runtime.block_on(future))
        }
    }
}

fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    match trimmed.char_indices().nth(STDERR_EXCERPT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

fn is_unavailable(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    UNAVAILABLE_MARKERS.iter().any(|marker| lower.contains(marker))
}

impl ExtractionTool for YtDlpTool {
    fn invoke(&self, url: &str, timeout: Duration) -> Result<ToolOutput, UpstreamError> {
        let started = Instant::now();
        let captured = self.run(&self.command_args(url), timeout)?;

        if !captured.success {
            if is_unavailable(&captured.stderr) {
                return Err(UpstreamError::ResourceUnavailable {
                    reason: excerpt(&captured.stderr),
                });
            }
            return Err(UpstreamError::NonZeroExit {
                status: captured.status,
                stderr: excerpt(&captured.stderr),
            });
        }

        let output = parse_tool_output(url, &captured.stdout, Utc::now().timestamp())?;
        tracing::debug!(
            url,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ttl_hint = ?output.ttl_hint,
            "yt-dlp resolved locator"
        );
        Ok(output)
    }
}

// ============================================================================
// OUTPUT PARSING
// ============================================================================

/// Parse `yt-dlp -j` output for `source_url`. `now_unix` anchors the expiry
/// hint carried by the locator.
pub fn parse_tool_output(
    source_url: &str,
    stdout: &str,
    now_unix: i64,
) -> Result<ToolOutput, UpstreamError> {
    let document = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| UpstreamError::MalformedOutput {
            reason: "empty output".to_string(),
        })?;

    let info: Value = serde_json::from_str(document).map_err(|e| UpstreamError::MalformedOutput {
        reason: format!("invalid JSON: {}", e),
    })?;
    if !info.is_object() {
        return Err(UpstreamError::MalformedOutput {
            reason: "expected a JSON object".to_string(),
        });
    }

    let locator = extract_locator(&info).ok_or_else(|| UpstreamError::ResourceUnavailable {
        reason: "tool output carries no stream locator".to_string(),
    })?;

    let parsed = Url::parse(&locator).map_err(|e| UpstreamError::MalformedOutput {
        reason: format!("locator is not a valid URL: {}", e),
    })?;

    let quality = info
        .get("format")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown");
    let format = if locator.contains(".m3u8") { "hls" } else { "dash" };
    let protocol = if parsed.scheme() == "https" { "https" } else { "http" };

    let mut output = ToolOutput::new(locator.clone())
        .with_attribute(ATTR_QUALITY, quality)
        .with_attribute(ATTR_FORMAT, format)
        .with_attribute(ATTR_PROTOCOL, protocol)
        .with_attribute(ATTR_SOURCE, source_url);
    if let Some(expires_unix) = expiry_hint(&parsed) {
        let remaining = u64::try_from(expires_unix.saturating_sub(now_unix)).unwrap_or(0);
        output = output.with_ttl_hint(Duration::from_secs(remaining));
    }
    Ok(output)
}

fn extract_locator(info: &Value) -> Option<String> {
    let direct = info
        .get("url")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty());
    if let Some(url) = direct {
        return Some(url.to_string());
    }
    info.get("formats")?
        .as_array()?
        .iter()
        .filter_map(|f| f.get("url").and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
        .map(str::to_string)
}

/// Unix expiry from an `expire=` query parameter or an `/expire/<ts>/`
/// path segment.
fn expiry_hint(locator: &Url) -> Option<i64> {
    let from_query = locator
        .query_pairs()
        .find(|(name, _)| name == "expire")
        .and_then(|(_, value)| value.parse::<i64>().ok());
    if from_query.is_some() {
        return from_query;
    }
    let segments: Vec<&str> = locator.path_segments()?.collect();
    segments
        .windows(2)
        .find(|pair| pair[0] == "expire")
        .and_then(|pair| pair[1].parse::<i64>().ok())
}

// ============================================================================
// TESTS
// ============================================================================
