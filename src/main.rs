//! NGX Cache Service
//!
//! Runs the response cache with its monitor, the monitoring REST API and a
//! Prometheus `/metrics` endpoint.
//!
//! ```text
//!   Args/env ──► CacheSettings ──► CacheManager ──┬──► CacheMonitor (poll loop)
//!                                                 ├──► ApiServer    (:8090)
//!                                                 └──► /metrics     (:8080)
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ngx_cache::{
    ApiServer, ApiServerConfig, AlertManager, CacheManager, CacheMonitor, CacheSettings,
    CacheStoreRef, Error, PrometheusTelemetry, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// NGX Cache - multi-tier response cache service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// YAML settings file (replaces the cache flags below)
    #[arg(long, env = "CACHE_CONFIG_FILE")]
    config_file: Option<String>,

    /// Eviction policy (lru, lfu, fifo, ttl, hybrid)
    #[arg(long, env = "CACHE_POLICY", default_value = "hybrid")]
    cache_policy: String,

    /// Default entry TTL in seconds (0 = no expiry)
    #[arg(long, env = "CACHE_TTL", default_value = "3600")]
    cache_ttl: u64,

    /// Memory budget in MB
    #[arg(long, env = "MAX_MEMORY_SIZE", default_value = "1024")]
    max_memory_size: u64,

    /// Number of cache partitions
    #[arg(long, env = "CACHE_PARTITIONS", default_value = "16")]
    cache_partitions: usize,

    /// Share of each partition budget given to L1
    #[arg(long, env = "L1_SIZE_RATIO", default_value = "0.2")]
    l1_size_ratio: f64,

    /// Access ratio that promotes an L2 entry into L1
    #[arg(long, env = "PREFETCH_THRESHOLD", default_value = "0.8")]
    prefetch_threshold: f64,

    /// Minimum value size (bytes) for compression
    #[arg(long, env = "COMPRESSION_THRESHOLD", default_value = "1024")]
    compression_threshold: u64,

    /// Compression level (1-9)
    #[arg(long, env = "COMPRESSION_LEVEL", default_value = "6")]
    compression_level: u32,

    /// Use Redis as the L2 tier
    #[arg(long, env = "USE_REDIS")]
    use_redis: bool,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Monitor poll interval in seconds
    #[arg(long, env = "MONITOR_INTERVAL", default_value = "60")]
    monitor_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn settings(&self) -> Result<CacheSettings> {
        if let Some(path) = &self.config_file {
            return CacheSettings::from_yaml_file(path);
        }

        let settings = CacheSettings {
            cache_policy: self.cache_policy.clone(),
            cache_ttl: self.cache_ttl,
            max_memory_size: self.max_memory_size,
            cache_partitions: self.cache_partitions,
            l1_size_ratio: self.l1_size_ratio,
            prefetch_threshold: self.prefetch_threshold,
            compression_threshold: self.compression_threshold,
            compression_level: self.compression_level,
            use_redis: self.use_redis,
            redis_url: self.redis_url.clone(),
            ..Default::default()
        };
        settings.validate()?;
        Ok(settings)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let settings = args.settings()?;
    info!(
        version = ngx_cache::VERSION,
        policy = %settings.cache_policy,
        partitions = settings.cache_partitions,
        max_memory_mb = settings.max_memory_size,
        use_redis = settings.use_redis,
        "Starting NGX cache service"
    );

    let telemetry = Arc::new(PrometheusTelemetry::new()?);
    let cache = Arc::new(
        CacheManager::connect(settings.manager_config()?, settings.redis_config())
            .await?
            .with_telemetry(telemetry.clone()),
    );

    // Start monitor
    let alerts = Arc::new(AlertManager::new());
    let monitor = Arc::new(CacheMonitor::new(cache.clone(), alerts));
    monitor
        .start_monitoring(Some(Duration::from_secs(args.monitor_interval_secs.max(1))))
        .await?;

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_telemetry = telemetry.clone();
    let metrics_cache = cache.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_telemetry, metrics_cache).await {
            error!(error = %e, "Metrics server error");
        }
    });

    // Create and run API server
    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
        ..Default::default()
    };
    let store: CacheStoreRef = cache.clone();
    let api_server = Arc::new(ApiServer::new(api_config, store, monitor.clone()));

    let runner = api_server.clone();
    let api_handle = tokio::spawn(async move { runner.run().await });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    api_server.shutdown();
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server exited with error"),
        Err(e) => error!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    monitor.stop_monitoring().await;
    cache.close().await;

    info!("Cache service shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "axum=info", "redis=warn"] {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| Error::Configuration(format!("Invalid log directive: {}", e)))?,
        );
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
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    telemetry: Arc<PrometheusTelemetry>,
    cache: Arc<CacheManager>,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let telemetry = telemetry.clone();
        let cache = cache.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let telemetry = telemetry.clone();
                let cache = cache.clone();
                async move {
                    let mut response = match req.uri().path() {
                        "/metrics" => {
                            // Refresh gauges from a fresh snapshot
                            cache.get_stats();
                            match telemetry.encode() {
                                Ok((content_type, buffer)) => {
                                    let mut response = Response::new(Body::from(buffer));
                                    if let Ok(value) = content_type.parse() {
                                        response
                                            .headers_mut()
                                            .insert(hyper::header::CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => {
                                    let mut response = Response::new(Body::from(e.to_string()));
                                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                    response
                                }
                            }
                        }
                        "/healthz" | "/livez" => Response::new(Body::from("ok")),
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    response
                        .headers_mut()
                        .entry(hyper::header::CACHE_CONTROL)
                        .or_insert(hyper::header::HeaderValue::from_static("no-store"));
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!(addr = %addr, "Metrics server listening");
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
