//! Metrics module
//!
//! Process-wide Prometheus metrics for the proxy and the cache daemon,
//! registered with the default registry on first use and exported by the
//! admin server at `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

/// Proxy transfers by outcome (`ok`, `not_found`, `no_channel`, ...)
pub static TRANSFERS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shmcache_proxy_transfers_total",
        "Proxy transfers by outcome",
        &["outcome"]
    )
    .expect("metric can be registered")
});

/// Bytes forwarded to clients
pub static BYTES_FORWARDED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "shmcache_proxy_bytes_forwarded_total",
        "Bytes forwarded from shared channels to clients"
    )
    .expect("metric can be registered")
});

/// Channels currently available in the proxy pool
pub static CHANNELS_AVAILABLE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "shmcache_proxy_channels_available",
        "Shared channels currently available in the pool"
    )
    .expect("metric can be registered")
});

/// Channels retired after an abandoned handshake
pub static CHANNELS_RETIRED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "shmcache_proxy_channels_retired_total",
        "Shared channels replaced after an abandoned transfer"
    )
    .expect("metric can be registered")
});

/// Daemon tasks by result (`hit`, `miss`, `attach_failed`, `abandoned`, `error`)
pub static CACHE_TASKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shmcache_daemon_tasks_total",
        "Cache daemon transfer tasks by result",
        &["result"]
    )
    .expect("metric can be registered")
});

/// Tasks waiting in the daemon queue
pub static CACHE_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "shmcache_daemon_queue_depth",
        "Transfer tasks waiting for a cache worker"
    )
    .expect("metric can be registered")
});

/// Touch every metric so it shows up in `/metrics` before first use.
pub fn init() {
    Lazy::force(&TRANSFERS_TOTAL);
    Lazy::force(&BYTES_FORWARDED_TOTAL);
    Lazy::force(&CHANNELS_AVAILABLE);
    Lazy::force(&CHANNELS_RETIRED_TOTAL);
    Lazy::force(&CACHE_TASKS_TOTAL);
    Lazy::force(&CACHE_QUEUE_DEPTH);
}

/// Render the default registry in the text exposition format.
pub fn render() -> String {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
