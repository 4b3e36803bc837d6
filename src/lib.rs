//! shmcache - Shared-Memory Content Cache
//!
//! A web proxy and a local cache daemon that move content between two
//! processes through POSIX shared memory instead of sockets.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐  control socket   ┌──────────────────────────────┐
//! │          webproxy            │ ────────────────▶ │         simplecached         │
//! │                              │  "<chan> <key>    │                              │
//! │  hyper ─▶ TransferHandler    │   <capacity>\n"   │  Boss ─▶ TaskQueue ─▶ Workers│
//! │               │              │                   │                       │      │
//! │          ChannelPool         │                   │                ContentStore  │
//! └───────────────┼──────────────┘                   └───────────────────────┼──────┘
//!                 │        ┌─────────────────────────────────────┐           │
//!                 └───────▶│  SharedChannel (/proxy_shm_N)       │◀──────────┘
//!                          │  header: 2 semaphores + chunk state │
//!                          │  data:   capacity - header bytes    │
//!                          └─────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`shm`] - Shared channels, the chunk handshake and the channel pool
//! - [`control`] - Control socket protocol
//! - [`cache`] - Cache daemon (boss, task queue, workers, content stores)
//! - [`proxy`] - Transfer handler and HTTP front end
//! - [`config`] - Validated configuration for both processes
//! - [`metrics`] - Prometheus metrics
//! - [`admin`] - Health and metrics HTTP server
//! - [`telemetry`] - Logging setup
//! - [`shutdown`] - SIGINT/SIGTERM handling for the binaries
//! - [`error`] - Error types

pub mod admin;
pub mod cache;
pub mod config;
pub mod control;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod shm;
pub mod shutdown;
pub mod telemetry;

// Re-export commonly used types
pub use cache::{CacheDaemon, ContentStore, FileStore, MemoryStore};
pub use config::{DaemonConfig, ProxyConfig};
pub use control::{ControlClient, ControlRequest};
pub use error::{Error, Result};
pub use proxy::{ResponseSink, ResponseStatus, TransferHandler};
pub use shm::{ChannelPool, SharedChannel};
