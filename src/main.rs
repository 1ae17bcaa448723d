//! Hybrid Cache Load Driver
//!
//! Runs a concurrent read-through workload against a [`HybridCache`] backed
//! by an in-memory distributed store, then keeps serving metrics until
//! interrupted.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Hybrid Cache Load Driver                     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Workers    │───▶│ HybridCache  │───▶│  In-memory   │       │
//! │  │ (N callers)  │    │  L1 + coord  │    │  L2 store    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │                             │                                    │
//! │                      /metrics, /healthz                          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hybrid_cache::cache::PrometheusExporter;
use hybrid_cache::{
    CacheError, CacheValue, EntryOptions, HybridCache, HybridCacheConfig, InMemoryDistributedStore,
    Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Hybrid Cache - concurrent read-through load driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Concurrent callers
    #[arg(long, env = "WORKERS", default_value = "32")]
    workers: usize,

    /// Distinct keys in the working set
    #[arg(long, env = "KEYS", default_value = "16")]
    keys: usize,

    /// Lookups per worker
    #[arg(long, env = "ITERATIONS", default_value = "1000")]
    iterations: usize,

    /// Simulated value factory latency in milliseconds
    #[arg(long, env = "FACTORY_DELAY_MS", default_value = "20")]
    factory_delay_ms: u64,

    /// Simulated distributed store latency in milliseconds
    #[arg(long, env = "STORE_LATENCY_MS", default_value = "1")]
    store_latency_ms: u64,

    /// Every Nth lookup uses a caller token that fires early (0 disables)
    #[arg(long, env = "CANCEL_EVERY", default_value = "10")]
    cancel_every: usize,

    /// Every Nth lookup by worker 0 removes the key first (0 disables)
    #[arg(long, env = "INVALIDATE_EVERY", default_value = "50")]
    invalidate_every: usize,

    /// JSON configuration file
    #[arg(long, env = "CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Metrics and health server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// Value produced by the simulated backend
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Item {
    key: String,
    version: u64,
    tags: Vec<String>,
}

impl CacheValue for Item {}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = match &args.config {
        Some(path) => HybridCacheConfig::from_file(path)?,
        None => HybridCacheConfig::default(),
    };

    info!("Starting hybrid cache load driver");
    info!("  Workers: {}", args.workers);
    info!("  Keys: {}", args.keys);
    info!("  Iterations per worker: {}", args.iterations);
    info!("  Factory delay: {}ms", args.factory_delay_ms);
    info!("  Write policy: {:?}", config.distributed_write_policy);

    let store = Arc::new(
        InMemoryDistributedStore::new().with_latency(Duration::from_millis(args.store_latency_ms)),
    );
    let cache = HybridCache::builder(config).distributed_store(store).build()?;

    let exporter = Arc::new(PrometheusExporter::new().map_err(|e| {
        CacheError::Internal(format!("Failed to create metrics registry: {}", e))
    })?);

    // Start metrics server
    let server_cache = cache.clone();
    let server_exporter = Arc::clone(&exporter);
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, server_cache, server_exporter).await {
            error!("Metrics server error: {}", e);
        }
    });

    run_workload(&args, &cache).await;

    let snapshot = cache.metrics();
    info!(
        factory_executions = snapshot.factory_executions,
        stampede_joins = snapshot.stampede_joins,
        l1_hit_ratio = snapshot.l1_hit_ratio,
        caller_cancellations = snapshot.caller_cancellations,
        group_cancellations = snapshot.group_cancellations,
        stale_writebacks_suppressed = snapshot.stale_writebacks_suppressed,
        "Workload complete"
    );
    info!("Serving metrics until interrupted");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CacheError::Internal(format!("Failed to listen for shutdown: {}", e)))?;

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

async fn run_workload(args: &Args, cache: &HybridCache) {
    let keys = args.keys.max(1);
    let mut handles = Vec::with_capacity(args.workers);

    for worker in 0..args.workers {
        let cache = cache.clone();
        let iterations = args.iterations;
        let delay = Duration::from_millis(args.factory_delay_ms);
        let cancel_every = args.cancel_every;
        let invalidate_every = args.invalidate_every;

        handles.push(tokio::spawn(async move {
            let mut served = 0usize;
            for i in 0..iterations {
                let key = format!("item:{}", (worker * 7 + i) % keys);

                if worker == 0 && invalidate_every > 0 && i % invalidate_every == 0 {
                    cache.remove_key(&key).await;
                }

                let caller = CancellationToken::new();
                if cancel_every > 0 && (worker + i) % cancel_every == 0 {
                    let early = caller.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay / 2).await;
                        early.cancel();
                    });
                }

                let factory_key = key.clone();
                let factory = move |token: CancellationToken| async move {
                    tokio::select! {
                        _ = token.cancelled() => Err(anyhow::anyhow!("factory abandoned")),
                        _ = tokio::time::sleep(delay) => Ok(Item {
                            key: factory_key,
                            version: i as u64,
                            tags: vec!["generated".to_string()],
                        }),
                    }
                };

                match cache
                    .get_or_create_with(&key, factory, &EntryOptions::new(), &caller)
                    .await
                {
                    Ok(item) => {
                        debug!(worker, key = %item.key, version = item.version, "served");
                        served += 1;
                    }
                    Err(e) if e.is_cancelled() => debug!(worker, key = %key, "caller detached"),
                    Err(e) => error!(worker, key = %key, error = %e, "lookup failed"),
                }
            }
            served
        }));
    }

    let mut served = 0usize;
    for handle in handles {
        match handle.await {
            Ok(count) => served += count,
            Err(e) => error!("Worker failed: {}", e),
        }
    }
    info!(served, in_flight = cache.in_flight(), "All workers finished");
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    cache: HybridCache,
    exporter: Arc<PrometheusExporter>,
) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| CacheError::Internal(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CacheError::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| CacheError::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let cache = cache.clone();
        let exporter = Arc::clone(&exporter);

        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let cache = cache.clone();
            let exporter = Arc::clone(&exporter);
            async move {
                let response = match req.uri().path() {
                    "/metrics" => {
                        exporter.update(&cache.metrics());
                        match exporter.render() {
                            Ok(text) => respond(StatusCode::OK, text),
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        }
                    }
                    "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
                    _ => respond(StatusCode::NOT_FOUND, "not found"),
                };
                Ok::<_, std::convert::Infallible>(response)
            }
        });

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
