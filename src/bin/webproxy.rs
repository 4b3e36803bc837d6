//! webproxy - HTTP front end backed by the shared-memory cache
//!
//! Creates the channel pool at startup, serves GET requests by streaming
//! content from simplecached through it, and removes every channel on exit.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use shmcache::admin::{self, ServiceStatus, StatusProvider};
use shmcache::config::{
    ProxyConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_CHANNEL_COUNT, DEFAULT_CHANNEL_PREFIX,
    DEFAULT_CONNECT_RETRIES, DEFAULT_HANDLER_THREADS, DEFAULT_SOCKET_PATH,
};
use shmcache::error::{Error, Result};
use shmcache::{proxy, shutdown, telemetry, ChannelPool, TransferHandler};

/// Time allowed for in-flight transfers at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// CLI Arguments
// =============================================================================

/// webproxy - serve cached content over HTTP through shared memory
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen port
    #[arg(short = 'p', long, env = "PROXY_PORT", default_value_t = 16642)]
    port: u16,

    /// Listen address
    #[arg(long, env = "PROXY_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Request handler threads (1-80)
    #[arg(
        short = 't',
        long,
        env = "PROXY_THREADS",
        default_value_t = DEFAULT_HANDLER_THREADS
    )]
    threads: usize,

    /// Number of shared memory segments (1-1024)
    #[arg(
        short = 'n',
        long,
        env = "PROXY_SEGMENT_COUNT",
        default_value_t = DEFAULT_CHANNEL_COUNT
    )]
    segment_count: usize,

    /// Size of each shared memory segment in bytes
    #[arg(
        short = 'z',
        long,
        env = "PROXY_SEGMENT_SIZE",
        default_value_t = DEFAULT_CHANNEL_CAPACITY
    )]
    segment_size: usize,

    /// Shared memory name prefix
    #[arg(long, env = "PROXY_SHM_PREFIX", default_value = DEFAULT_CHANNEL_PREFIX)]
    shm_prefix: String,

    /// Cache daemon control socket
    #[arg(long, env = "CACHE_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Control connection attempts
    #[arg(long, env = "PROXY_CONNECT_RETRIES", default_value_t = DEFAULT_CONNECT_RETRIES)]
    connect_retries: u32,

    /// Delay between control connection attempts, in milliseconds
    #[arg(long, env = "PROXY_RETRY_DELAY_MS", default_value_t = 1000)]
    retry_delay_ms: u64,

    /// Give up on a chunk after this many milliseconds (default: wait forever)
    #[arg(long, env = "PROXY_HANDSHAKE_TIMEOUT_MS")]
    handshake_timeout_ms: Option<u64>,

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
    fn to_config(&self) -> ProxyConfig {
        ProxyConfig {
            listen_addr: SocketAddr::new(self.bind, self.port),
            handler_threads: self.threads,
            channel_count: self.segment_count,
            channel_capacity: self.segment_size,
            channel_prefix: self.shm_prefix.clone(),
            socket_path: self.socket.clone(),
            connect_retries: self.connect_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            handshake_timeout: self.handshake_timeout_ms.map(Duration::from_millis),
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

    // Transfers block on semaphores, so they run on the blocking pool,
    // sized to the handler thread count.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.handler_threads)
        .thread_name("webproxy")
        .build()?;
    let result = runtime.block_on(run(config));

    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn run(config: ProxyConfig) -> Result<()> {
    info!("Starting webproxy");
    info!("  Listen: {}", config.listen_addr);
    info!("  Handler threads: {}", config.handler_threads);
    info!(
        "  Segments: {} x {} bytes ({})",
        config.channel_count, config.channel_capacity, config.channel_prefix
    );
    info!("  Cache socket: {}", config.socket_path.display());

    let pool = Arc::new(ChannelPool::create(
        &config.channel_prefix,
        config.channel_count,
        config.channel_capacity,
    )?);

    let result = serve(&config, pool.clone()).await;

    let destroyed = pool.destroy_all();
    info!(destroyed, "Shared memory segments removed");
    result
}

async fn serve(config: &ProxyConfig, pool: Arc<ChannelPool>) -> Result<()> {
    if let Some(addr) = config.metrics_addr {
        let pool = pool.clone();
        let status: Arc<dyn StatusProvider> = Arc::new(move || ServiceStatus {
            channels_available: Some(pool.available()),
            channels_total: Some(pool.len()),
            ..ServiceStatus::new("webproxy", !pool.is_empty())
        });
        tokio::spawn(async move {
            if let Err(e) = admin::run_admin_server(addr, status).await {
                error!("Admin server error: {}", e);
            }
        });
    }

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", config.listen_addr, e)))?;

    let handler = Arc::new(TransferHandler::from_config(pool, config));
    proxy::serve(listener, handler, shutdown::shutdown_signal()).await
}
