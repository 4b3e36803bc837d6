//! simplecached - local cache daemon
//!
//! Serves content from an index of local files to the web proxy through the
//! shared channels the proxy announces on the control socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use shmcache::admin::{self, ServiceStatus, StatusProvider};
use shmcache::config::{DaemonConfig, DEFAULT_SOCKET_PATH, DEFAULT_WORKER_THREADS};
use shmcache::error::{Error, Result};
use shmcache::{metrics, shutdown, telemetry, CacheDaemon, FileStore};

/// Time allowed for workers to finish in-flight transfers at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// CLI Arguments
// =============================================================================

/// simplecached - shared-memory cache daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Content index file (`<key> <path>` per line)
    #[arg(
        short = 'c',
        long = "cachedir",
        env = "CACHE_INDEX",
        default_value = "locals.txt"
    )]
    index: PathBuf,

    /// Worker thread count (1-100)
    #[arg(
        short = 't',
        long,
        env = "CACHE_THREADS",
        default_value_t = DEFAULT_WORKER_THREADS
    )]
    threads: usize,

    /// Delay before each lookup, in microseconds (0-2500000)
    #[arg(short = 'd', long, env = "CACHE_DELAY_US", default_value_t = 0)]
    delay: u64,

    /// Control socket path
    #[arg(long, env = "CACHE_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Health and metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn to_config(&self) -> DaemonConfig {
        DaemonConfig {
            socket_path: self.socket.clone(),
            index_path: self.index.clone(),
            worker_threads: self.threads,
            delay: Duration::from_micros(self.delay),
            metrics_addr: self.metrics_addr,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init_logging(&args.log_level, args.log_json)?;

    let config = args.to_config();
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(config));

    // `run` already gave busy workers their grace period.
    runtime.shutdown_background();
    result
}

async fn run(config: DaemonConfig) -> Result<()> {
    info!("Starting simplecached");
    info!("  Index: {}", config.index_path.display());
    info!("  Socket: {}", config.socket_path.display());
    info!("  Workers: {}", config.worker_threads);
    info!("  Delay: {} us", config.delay.as_micros());

    let store = Arc::new(FileStore::open(&config.index_path)?);
    let metrics_addr = config.metrics_addr;
    let daemon = CacheDaemon::start(config, store)?;

    let running = Arc::new(AtomicBool::new(true));
    if let Some(addr) = metrics_addr {
        let running = running.clone();
        let status: Arc<dyn StatusProvider> = Arc::new(move || ServiceStatus {
            queued_tasks: Some(metrics::CACHE_QUEUE_DEPTH.get().max(0) as usize),
            ..ServiceStatus::new("simplecached", running.load(Ordering::Relaxed))
        });
        tokio::spawn(async move {
            if let Err(e) = admin::run_admin_server(addr, status).await {
                error!("Admin server error: {}", e);
            }
        });
    }

    shutdown::shutdown_signal().await;
    running.store(false, Ordering::Relaxed);
    daemon.stop();

    let joined = tokio::task::spawn_blocking(move || daemon.join_timeout(SHUTDOWN_GRACE))
        .await
        .map_err(|e| Error::Internal(format!("daemon join failed: {}", e)))?;
    if joined {
        info!("simplecached shutdown complete");
    } else {
        warn!("Workers still busy after {:?}; exiting", SHUTDOWN_GRACE);
    }
    Ok(())
}
