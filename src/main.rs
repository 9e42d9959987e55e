//! tiercache - Cache Workload Driver
//!
//! Runs a multi-threaded get/put workload against one cache and reports
//! its statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        tiercache CLI                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐   ┌──────────┐        ┌──────────────────┐     │
//! │  │ Worker 0 │…  │ Worker N │──────▶ │      Cache       │     │
//! │  └──────────┘   └──────────┘        │ memory ▶ disk    │     │
//! │        reporter (periodic stats) ◀──┤                  │     │
//! │        /metrics (optional)       ◀──┴──────────────────┘     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::statistics::StatisticsSnapshot;
use tiercache::{
    Cache, CacheConfiguration, CacheManager, Element, ElementKey, ElementValue, EvictionPolicy,
    ManagerConfiguration, MemoryCapacity,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - drive a get/put workload through a tiered cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache name (also the disk file stem)
    #[arg(long, env = "TIERCACHE_NAME", default_value = "bench")]
    name: String,

    /// Maximum elements held in memory
    #[arg(long, env = "TIERCACHE_MAX_ELEMENTS", default_value = "10000")]
    max_elements: usize,

    /// Memory bound in bytes instead of an element count
    #[arg(long, env = "TIERCACHE_MAX_BYTES")]
    max_bytes: Option<u64>,

    /// Eviction policy (lru, lfu, fifo)
    #[arg(long, env = "TIERCACHE_POLICY", default_value = "lru")]
    policy: EvictionPolicy,

    /// Time to live in seconds (0 = unlimited)
    #[arg(long, env = "TIERCACHE_TTL", default_value = "0")]
    ttl: u64,

    /// Time to idle in seconds (0 = unlimited)
    #[arg(long, env = "TIERCACHE_TTI", default_value = "0")]
    tti: u64,

    /// Never expire elements
    #[arg(long, env = "TIERCACHE_ETERNAL")]
    eternal: bool,

    /// Overflow memory evictions to disk
    #[arg(long, env = "TIERCACHE_OVERFLOW")]
    overflow: bool,

    /// Keep the disk tier across runs
    #[arg(long, env = "TIERCACHE_PERSISTENT")]
    persistent: bool,

    /// Directory for disk tier files
    #[arg(long, env = "TIERCACHE_DISK_PATH", default_value = "./tiercache-data")]
    disk_path: PathBuf,

    /// Worker threads
    #[arg(long, env = "TIERCACHE_THREADS", default_value = "4")]
    threads: usize,

    /// Operations per worker
    #[arg(long, env = "TIERCACHE_OPERATIONS", default_value = "100000")]
    operations: u64,

    /// Number of distinct keys
    #[arg(long, env = "TIERCACHE_KEYS", default_value = "50000")]
    keys: u64,

    /// Value size in bytes
    #[arg(long, env = "TIERCACHE_VALUE_SIZE", default_value = "256")]
    value_size: usize,

    /// Percentage of operations that are gets
    #[arg(long, env = "TIERCACHE_GET_PERCENT", default_value = "80")]
    get_percent: u8,

    /// Seconds between statistics reports
    #[arg(long, env = "TIERCACHE_REPORT_INTERVAL", default_value = "5")]
    report_interval: u64,

    /// Metrics server bind address (disabled when absent)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn cache_configuration(&self) -> CacheConfiguration {
        let capacity = match self.max_bytes {
            Some(bytes) => MemoryCapacity::Bytes(bytes),
            None => MemoryCapacity::Elements(self.max_elements),
        };

        CacheConfiguration::new(self.name.clone(), self.max_elements)
            .with_memory_capacity(capacity)
            .with_eviction_policy(self.policy)
            .with_eternal(self.eternal)
            .with_time_to_live(self.ttl)
            .with_time_to_idle(self.tti)
            .with_overflow_to_disk(self.overflow)
            .with_disk_persistent(self.persistent)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting tiercache workload");
    info!("  Cache: {} ({} policy)", args.name, args.policy);
    info!("  Workers: {} x {} operations", args.threads, args.operations);
    info!("  Keys: {}, value size: {} bytes", args.keys, args.value_size);
    info!(
        "  Overflow: {}, persistent: {}",
        args.overflow, args.persistent
    );

    let manager = CacheManager::new(ManagerConfiguration::new(&args.disk_path));
    let cache = Cache::new(args.cache_configuration()).context("invalid cache configuration")?;
    manager
        .add_cache(cache.clone())
        .context("failed to start cache")?;

    if let Some(stats) = cache.disk_stats() {
        info!(entries = stats.entries, "Disk tier opened");
    }

    let gauges = Arc::new(CacheGauges::register().context("failed to register metrics")?);
    if let Some(addr) = args.metrics_addr.clone() {
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr).await {
                error!("Metrics server error: {:#}", e);
            }
        });
    }

    let workload = Workload {
        operations: args.operations,
        keys: args.keys.max(1),
        value_size: args.value_size,
        get_percent: args.get_percent.min(100),
    };

    let started = Instant::now();
    let mut workers = JoinSet::new();
    for id in 0..args.threads.max(1) {
        let cache = cache.clone();
        workers.spawn_blocking(move || run_worker(id, &cache, workload));
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.report_interval.max(1)));
    ticker.tick().await;

    let mut totals = WorkerReport::default();
    loop {
        tokio::select! {
            joined = workers.join_next() => match joined {
                Some(Ok(report)) => totals.merge(&report),
                Some(Err(e)) => error!("Worker failed: {}", e),
                None => break,
            },
            _ = ticker.tick() => {
                let snapshot = cache.statistics();
                gauges.update(&snapshot);
                report(&snapshot);
            }
        }
    }

    let elapsed = started.elapsed();
    let snapshot = cache.statistics();
    gauges.update(&snapshot);

    info!(
        gets = totals.gets,
        puts = totals.puts,
        errors = totals.errors,
        elapsed_ms = elapsed.as_millis() as u64,
        ops_per_sec = (totals.gets + totals.puts) as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        "Workload complete"
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("failed to encode statistics")?
    );

    manager.shutdown().context("failed to shut down cache")?;
    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Workload {
    operations: u64,
    keys: u64,
    value_size: usize,
    get_percent: u8,
}

#[derive(Debug, Default)]
struct WorkerReport {
    gets: u64,
    puts: u64,
    errors: u64,
}

impl WorkerReport {
    fn merge(&mut self, other: &WorkerReport) {
        self.gets += other.gets;
        self.puts += other.puts;
        self.errors += other.errors;
    }
}

fn run_worker(id: usize, cache: &Cache, workload: Workload) -> WorkerReport {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42 + id as u64);
    let mut value = vec![0u8; workload.value_size];
    let mut report = WorkerReport::default();

    for _ in 0..workload.operations {
        let key = ElementKey::from(format!("key-{}", rng.random_range(0..workload.keys)));
        let roll: u8 = rng.random_range(0..100);

        let result = if roll < workload.get_percent {
            report.gets += 1;
            cache.get(key).map(|_| ())
        } else {
            report.puts += 1;
            rng.fill_bytes(&mut value);
            cache.put(Element::new(key, ElementValue::from(value.clone())))
        };

        if let Err(e) = result {
            report.errors += 1;
            if e.is_not_alive() {
                warn!(worker = id, "Cache stopped, worker exiting");
                break;
            }
        }
    }

    report
}

fn report(snapshot: &StatisticsSnapshot) {
    info!(
        cache = %snapshot.cache_name,
        hits = snapshot.hits,
        memory_hits = snapshot.memory_hits,
        disk_hits = snapshot.disk_hits,
        misses = snapshot.misses,
        hit_ratio = snapshot.hit_ratio,
        memory = snapshot.memory_store_size,
        disk = snapshot.disk_store_size,
        evictions = snapshot.evictions,
        overflow_discards = snapshot.overflow_discards,
        avg_get_us = snapshot.average_get_time.as_micros() as u64,
        "Cache statistics"
    );
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

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn", level)));

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

/// Cache statistics exported as Prometheus gauges
struct CacheGauges {
    hits: prometheus::IntGauge,
    misses: prometheus::IntGauge,
    hit_ratio: prometheus::Gauge,
    memory_size: prometheus::IntGauge,
    disk_size: prometheus::IntGauge,
    evictions: prometheus::IntGauge,
    overflow_discards: prometheus::IntGauge,
}

impl CacheGauges {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            hits: prometheus::register_int_gauge!("tiercache_hits", "Cache hits")?,
            misses: prometheus::register_int_gauge!("tiercache_misses", "Cache misses")?,
            hit_ratio: prometheus::register_gauge!("tiercache_hit_ratio", "Hit ratio")?,
            memory_size: prometheus::register_int_gauge!(
                "tiercache_memory_store_size",
                "Elements held in memory"
            )?,
            disk_size: prometheus::register_int_gauge!(
                "tiercache_disk_store_size",
                "Elements held on disk"
            )?,
            evictions: prometheus::register_int_gauge!(
                "tiercache_evictions",
                "Elements evicted from memory"
            )?,
            overflow_discards: prometheus::register_int_gauge!(
                "tiercache_overflow_discards",
                "Evicted elements the disk tier did not accept"
            )?,
        })
    }

    fn update(&self, snapshot: &StatisticsSnapshot) {
        self.hits.set(snapshot.hits as i64);
        self.misses.set(snapshot.misses as i64);
        self.hit_ratio.set(snapshot.hit_ratio);
        self.memory_size.set(snapshot.memory_store_size as i64);
        self.disk_size.set(snapshot.disk_store_size as i64);
        self.evictions.set(snapshot.evictions as i64);
        self.overflow_discards.set(snapshot.overflow_discards as i64);
    }
}

async fn run_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let (status, body) = match req.uri().path() {
            "/metrics" => {
                let encoder = TextEncoder::new();
                let mut buffer = Vec::new();
                match encoder.encode(&prometheus::gather(), &mut buffer) {
                    Ok(()) => (StatusCode::OK, buffer),
                    Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes()),
                }
            }
            _ => (StatusCode::NOT_FOUND, b"not found".to_vec()),
        };

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {addr}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("metrics server accept error")?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
