//! ShellCache Smoke Harness
//!
//! Registers the worker script of a live origin, loads the shell through it
//! and fetches a few sub-resources, then reports what came from cache and how
//! long each step took. Run it twice against the same `--cache-dir` to see a
//! warm start.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use shellcache_common::{init_logging, with_timeout, LogConfig, LogFormat, ResultExt};
use shellcache_net::{FetcherConfig, HttpFetcher, Request};
use shellcache_sw::{
    ContainerConfig, DiskCacheStorage, Page, ResponseSource, ServiceWorkerContainer,
};
use tracing::{error, info, warn};
use url::Url;

/// Performance timing collector for tracking operation durations.
struct PerfTiming {
    timings: RefCell<HashMap<&'static str, Vec<Duration>>>,
}

impl PerfTiming {
    fn new() -> Self {
        Self {
            timings: RefCell::new(HashMap::new()),
        }
    }

    fn record(&self, operation: &'static str, duration: Duration) {
        self.timings
            .borrow_mut()
            .entry(operation)
            .or_default()
            .push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let timings = self.timings.borrow();
        let mut summary = serde_json::Map::new();

        for (op, durations) in timings.iter().filter(|(_, d)| !d.is_empty()) {
            let ms: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
            let total_ms: f64 = ms.iter().sum();
            let min_ms = ms.iter().copied().fold(f64::INFINITY, f64::min);
            let max_ms = ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let round = |v: f64| (v * 100.0).round() / 100.0;

            summary.insert(
                op.to_string(),
                json!({
                    "count": ms.len(),
                    "total_ms": round(total_ms),
                    "avg_ms": round(total_ms / ms.len() as f64),
                    "min_ms": round(min_ms),
                    "max_ms": round(max_ms),
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

/// Parse command line arguments
struct Args {
    origin: Option<String>,
    script: String,
    version_manifest: String,
    cache_dir: Option<PathBuf>,
    fetch: Vec<String>,
    timeout_ms: u64,
    log_format: LogFormat,
    perf_output: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut origin = None;
        let mut script = "sw.json".to_string();
        let mut version_manifest = "manifest.json".to_string();
        let mut cache_dir = None;
        let mut fetch = Vec::new();
        let mut timeout_ms = 30_000u64;
        let mut log_format = LogFormat::Pretty;
        let mut perf_output = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--origin" => origin = args.next(),
                "--script" => {
                    if let Some(val) = args.next() {
                        script = val;
                    }
                }
                "--version-manifest" => {
                    if let Some(val) = args.next() {
                        version_manifest = val;
                    }
                }
                "--cache-dir" => cache_dir = args.next().map(PathBuf::from),
                "--fetch" => fetch.extend(args.next()),
                "--timeout-ms" => {
                    if let Some(val) = args.next() {
                        timeout_ms = val.parse().unwrap_or(30_000);
                    }
                }
                "--log-format" => {
                    if let Some(val) = args.next() {
                        log_format = val.parse().unwrap_or_else(|e| {
                            eprintln!("Warning: {e}, using pretty");
                            LogFormat::Pretty
                        });
                    }
                }
                "--perf-output" => perf_output = args.next(),
                other => eprintln!("Warning: ignoring unknown argument {other}"),
            }
        }

        Self {
            origin,
            script,
            version_manifest,
            cache_dir,
            fetch,
            timeout_ms,
            log_format,
            perf_output,
        }
    }
}

fn usage() {
    eprintln!(
        "usage: shellcache-smoke --origin URL [--script PATH] [--version-manifest PATH] \
         [--cache-dir DIR] [--fetch PATH]... [--timeout-ms N] \
         [--log-format pretty|compact|json] [--perf-output FILE]"
    );
}

fn source_label(source: ResponseSource) -> &'static str {
    match source {
        ResponseSource::Cache => "cache",
        ResponseSource::Network => "network",
        ResponseSource::OfflineFallback => "offline-fallback",
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(LogConfig::default().with_format(args.log_format)) {
        eprintln!("Warning: logging not initialized: {e}");
    }

    let Some(origin) = args.origin.as_deref() else {
        usage();
        return ExitCode::FAILURE;
    };
    let origin = match Url::parse(origin) {
        Ok(url) => url,
        Err(e) => {
            error!(origin, error = %e, "Invalid origin");
            return ExitCode::FAILURE;
        }
    };

    info!(
        origin = %origin,
        script = %args.script,
        cache_dir = ?args.cache_dir,
        fetches = args.fetch.len(),
        "Starting ShellCache Smoke Harness"
    );

    let perf = PerfTiming::new();
    let timeout = Duration::from_millis(args.timeout_ms);
    let report = match run(&args, &origin, &perf, timeout).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Smoke run failed");
            return ExitCode::FAILURE;
        }
    };

    let output = json!({
        "origin": origin.as_str(),
        "responses": report,
        "timings": perf.summary(),
    });
    println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());

    if let Some(path) = args.perf_output.as_deref() {
        match std::fs::write(path, output.to_string()) {
            Ok(()) => info!(path, "Wrote perf summary"),
            Err(e) => warn!(path, error = %e, "Failed to write perf summary"),
        }
    }
    ExitCode::SUCCESS
}

async fn run(
    args: &Args,
    origin: &Url,
    perf: &PerfTiming,
    timeout: Duration,
) -> Result<Vec<serde_json::Value>, Box<dyn std::error::Error>> {
    let storage = match &args.cache_dir {
        Some(dir) => DiskCacheStorage::new(dir.clone())?,
        None => DiskCacheStorage::new(DiskCacheStorage::default_root())?,
    };
    let fetcher = HttpFetcher::new(
        origin,
        FetcherConfig {
            default_timeout: Some(timeout),
            ..Default::default()
        },
    )?;
    let container = Arc::new(ServiceWorkerContainer::new(
        ContainerConfig::default(),
        Arc::new(storage),
        Arc::new(fetcher),
    ));

    let script = origin
        .join(&args.script)
        .context(format!("resolving script path {}", args.script))?;
    let mut page = Page::open(container.clone(), origin.clone()).await;

    let start = Instant::now();
    let worker = with_timeout(timeout, || page.register(&script, &args.version_manifest)).await??;
    perf.record("register", start.elapsed());
    if let Some(active) = container.active_worker().await {
        info!(worker = %worker, cache = %active.cache_name, "Worker registered");
    }

    let mut report = Vec::new();

    let start = Instant::now();
    let document = with_timeout(timeout, || page.load()).await??;
    perf.record("load", start.elapsed());
    report.push(json!({
        "url": page.url().as_str(),
        "status": document.response.status.as_u16(),
        "source": source_label(document.source),
    }));

    for path in &args.fetch {
        let url = origin
            .join(path)
            .context(format!("resolving fetch path {path}"))?;
        let start = Instant::now();
        let outcome = with_timeout(timeout, || page.fetch(Request::get(url.clone()))).await??;
        perf.record("fetch", start.elapsed());

        if let Some(revalidation) = outcome.revalidation {
            let result = revalidation.join().await;
            info!(url = %url, ?result, "Background revalidation finished");
        }
        report.push(json!({
            "url": url.as_str(),
            "status": outcome.response.response.status.as_u16(),
            "source": source_label(outcome.response.source),
        }));
    }

    page.close().await;
    Ok(report)
}
