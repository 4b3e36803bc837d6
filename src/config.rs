//! Runtime configuration for the cache daemon and the proxy
//!
//! Both binaries build one of these from their command line and call
//! `validate()` before starting anything.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::shm::{HEADER_SIZE, MAX_CHANNEL_NAME_LEN};

/// Well-known control socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/cache_socket";

/// Default channel capacity in bytes (header included)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 5712;

/// Upper bound on channel capacity (16 MiB)
pub const MAX_CHANNEL_CAPACITY: usize = 16 * 1024 * 1024;

/// Default number of channels in the proxy pool
pub const DEFAULT_CHANNEL_COUNT: usize = 8;

/// Upper bound on the number of channels
pub const MAX_CHANNEL_COUNT: usize = 1024;

/// Default shared memory name prefix
pub const DEFAULT_CHANNEL_PREFIX: &str = "/proxy_shm_";

/// Default number of cache daemon worker threads
pub const DEFAULT_WORKER_THREADS: usize = 8;

/// Upper bound on cache daemon worker threads
pub const MAX_WORKER_THREADS: usize = 100;

/// Upper bound on the artificial per-request delay (microseconds)
pub const MAX_DELAY_MICROS: u64 = 2_500_000;

/// Default number of proxy request-handling threads
pub const DEFAULT_HANDLER_THREADS: usize = 8;

/// Upper bound on proxy request-handling threads
pub const MAX_HANDLER_THREADS: usize = 80;

/// Default proxy listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:16642";

/// Default control connection attempts
pub const DEFAULT_CONNECT_RETRIES: u32 = 5;

/// Default delay between control connection attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// Cache daemon
// =============================================================================

/// Cache daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Control socket path
    pub socket_path: PathBuf,
    /// Content index file (`<key> <path>` per line)
    pub index_path: PathBuf,
    /// Number of worker threads
    pub worker_threads: usize,
    /// Artificial delay applied before resolving each request
    pub delay: Duration,
    /// Optional admin (health/metrics) server address
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            index_path: PathBuf::from("locals.txt"),
            worker_threads: DEFAULT_WORKER_THREADS,
            delay: Duration::ZERO,
            metrics_addr: None,
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_WORKER_THREADS).contains(&self.worker_threads) {
            return Err(Error::Config(format!(
                "worker threads must be between 1 and {}, got {}",
                MAX_WORKER_THREADS, self.worker_threads
            )));
        }
        if self.delay > Duration::from_micros(MAX_DELAY_MICROS) {
            return Err(Error::Config(format!(
                "delay must not exceed {} us, got {} us",
                MAX_DELAY_MICROS,
                self.delay.as_micros()
            )));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(Error::Config("socket path must not be empty".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Proxy
// =============================================================================

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Client-facing listen address
    pub listen_addr: SocketAddr,
    /// Number of request-handling threads
    pub handler_threads: usize,
    /// Number of shared channels created at startup
    pub channel_count: usize,
    /// Capacity of each channel in bytes (header included)
    pub channel_capacity: usize,
    /// Shared memory name prefix; channel `i` is `<prefix><i>`
    pub channel_prefix: String,
    /// Control socket path of the cache daemon
    pub socket_path: PathBuf,
    /// Control connection attempts before giving up
    pub connect_retries: u32,
    /// Delay between control connection attempts
    pub retry_delay: Duration,
    /// Bound on each producer-ready wait; `None` waits forever
    pub handshake_timeout: Option<Duration>,
    /// Optional admin (health/metrics) server address
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 16642)),
            handler_threads: DEFAULT_HANDLER_THREADS,
            channel_count: DEFAULT_CHANNEL_COUNT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            connect_retries: DEFAULT_CONNECT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            handshake_timeout: None,
            metrics_addr: None,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_HANDLER_THREADS).contains(&self.handler_threads) {
            return Err(Error::Config(format!(
                "handler threads must be between 1 and {}, got {}",
                MAX_HANDLER_THREADS, self.handler_threads
            )));
        }
        if !(1..=MAX_CHANNEL_COUNT).contains(&self.channel_count) {
            return Err(Error::Config(format!(
                "channel count must be between 1 and {}, got {}",
                MAX_CHANNEL_COUNT, self.channel_count
            )));
        }
        if self.channel_capacity <= HEADER_SIZE || self.channel_capacity > MAX_CHANNEL_CAPACITY {
            return Err(Error::Config(format!(
                "channel capacity must be between {} and {} bytes, got {}",
                HEADER_SIZE + 1,
                MAX_CHANNEL_CAPACITY,
                self.channel_capacity
            )));
        }
        validate_prefix(&self.channel_prefix, self.channel_count)?;
        if self.connect_retries == 0 {
            return Err(Error::Config("connect retries must be at least 1".into()));
        }
        if self.handshake_timeout == Some(Duration::ZERO) {
            return Err(Error::Config(
                "handshake timeout must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

fn validate_prefix(prefix: &str, count: usize) -> Result<()> {
    let longest = prefix.len() + count.saturating_sub(1).to_string().len();
    if !prefix.starts_with('/')
        || prefix[1..].contains('/')
        || prefix.chars().any(char::is_whitespace)
        || longest > MAX_CHANNEL_NAME_LEN
    {
        return Err(Error::Config(format!(
            "channel prefix {:?} must start with '/', contain no other '/' or whitespace, \
             and leave room for the channel index",
            prefix
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_valid() {
        DaemonConfig::default().validate().unwrap();
        ProxyConfig::default().validate().unwrap();
        assert_eq!(
            ProxyConfig::default().listen_addr.to_string(),
            DEFAULT_LISTEN_ADDR
        );
    }

    #[test]
    fn test_daemon_thread_range() {
        let mut config = DaemonConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
        config.worker_threads = 101;
        assert_matches!(config.validate(), Err(Error::Config(_)));
        config.worker_threads = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_daemon_delay_bound() {
        let mut config = DaemonConfig {
            delay: Duration::from_micros(MAX_DELAY_MICROS + 1),
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
        config.delay = Duration::from_micros(MAX_DELAY_MICROS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_proxy_bounds() {
        let base = ProxyConfig::default();

        let config = ProxyConfig {
            handler_threads: 81,
            ..base.clone()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = ProxyConfig {
            channel_count: 0,
            ..base.clone()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = ProxyConfig {
            channel_capacity: HEADER_SIZE,
            ..base.clone()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = ProxyConfig {
            handshake_timeout: Some(Duration::ZERO),
            ..base
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_prefix_validation() {
        assert!(validate_prefix("/proxy_shm_", 8).is_ok());
        assert!(validate_prefix("proxy_shm_", 8).is_err());
        assert!(validate_prefix("/a/b_", 8).is_err());
        assert!(validate_prefix("/a b", 8).is_err());
        let long = format!("/{}", "x".repeat(MAX_CHANNEL_NAME_LEN - 1));
        assert!(validate_prefix(&long, 10).is_err());
    }
}
