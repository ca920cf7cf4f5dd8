//! Resolve stream locators from the command line.
//!
//! Usage: streamgate-resolve [--no-cache] [--timeout-secs N] <name=url>...
//!
//! Prints one JSON object per key on stdout. Configuration comes from the
//! `STREAMGATE_*` environment variables.

use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use streamgate_core::{ResolutionKey, ResolverConfig};
use streamgate_resolver::{
    connect_store, init_tracing, CompositeObserver, ExtractionTool, LogFormat, MetricsObserver,
    ResolutionObserver, ResolveRequest, StreamResolver, TracingObserver, YtDlpTool,
};

const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(120);

struct Args {
    use_cache: bool,
    timeout: Duration,
    requests: Vec<ResolveRequest>,
}

fn usage() {
    eprintln!("Usage: streamgate-resolve [--no-cache] [--timeout-secs N] <name=url>...");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  streamgate-resolve news1=https://www.youtube.com/@news/live");
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut args = Args {
        use_cache: true,
        timeout: DEFAULT_BATCH_TIMEOUT,
        requests: Vec::new(),
    };
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--no-cache" => args.use_cache = false,
            "--timeout-secs" => {
                let value = raw.next().ok_or("--timeout-secs needs a value")?;
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid --timeout-secs value: {}", value))?;
                args.timeout = Duration::from_secs(secs.max(1));
            }
            pair => {
                let (name, url) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("expected name=url, got {:?}", pair))?;
                let key = ResolutionKey::new(name).map_err(|e| e.to_string())?;
                args.requests.push(ResolveRequest::new(key, url));
            }
        }
    }
    if args.requests.is_empty() {
        return Err("no name=url pairs given".to_string());
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            usage();
            return ExitCode::from(2);
        }
    };

    if let Err(e) = init_tracing(LogFormat::from_env()) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    let config = ResolverConfig::from_env();
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return ExitCode::FAILURE;
    }

    let tool = YtDlpTool::new(config.tool.clone());
    let probe = tool.clone();
    match tokio::task::spawn_blocking(move || probe.version()).await {
        Ok(Ok(version)) => tracing::info!(version = %version, binary = %config.tool.binary, "Resolution tool available"),
        Ok(Err(e)) => {
            tracing::error!(error = %e, binary = %config.tool.binary, "Resolution tool unavailable");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            tracing::error!(error = %e, "Tool probe task failed");
            return ExitCode::FAILURE;
        }
    }

    let store = match connect_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to set up keyed store");
            return ExitCode::FAILURE;
        }
    };

    let mut observer = CompositeObserver::new().with(Arc::new(TracingObserver));
    match MetricsObserver::new() {
        Ok(metrics) => observer = observer.with(Arc::new(metrics)),
        Err(e) => tracing::warn!(error = %e, "Metrics disabled"),
    }
    let observer: Arc<dyn ResolutionObserver> = Arc::new(observer);
    let tool: Arc<dyn ExtractionTool> = Arc::new(tool);
    let resolver = StreamResolver::new(store, tool, observer, &config);

    let outcome = resolver
        .resolve_many(&args.requests, args.use_cache, args.timeout)
        .await;

    for (key, record) in &outcome.resolved {
        println!(
            "{}",
            json!({
                "key": key,
                "status": "resolved",
                "locator": record.locator,
                "attributes": record.attributes,
                "issued_at": record.issued_at,
                "expires_at": record.expires_at,
            })
        );
    }
    for (key, error) in &outcome.failed {
        let status = if error.is_busy() { "busy" } else { "failed" };
        println!(
            "{}",
            json!({ "key": key, "status": status, "error": error.to_string() })
        );
    }
    for key in &outcome.timed_out {
        println!("{}", json!({ "key": key, "status": "timed_out" }));
    }

    if outcome.resolved.len() == outcome.total() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, String> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_pairs_and_flags() {
        let parsed = args(&[
            "--no-cache",
            "--timeout-secs",
            "30",
            "news1=https://www.youtube.com/@news/live",
            "news2=https://www.youtube.com/watch?v=abc&t=1",
        ])
        .expect("valid args");
        assert!(!parsed.use_cache);
        assert_eq!(parsed.timeout, Duration::from_secs(30));
        assert_eq!(parsed.requests.len(), 2);
        assert_eq!(
            parsed.requests[1].external_key,
            "https://www.youtube.com/watch?v=abc&t=1"
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(args(&[]).is_err());
        assert!(args(&["news1"]).is_err());
        assert!(args(&["=https://example.com"]).is_err());
        assert!(args(&["--timeout-secs"]).is_err());
    }
}
