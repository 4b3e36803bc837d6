//! Shared-memory transport between the proxy and the cache daemon
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────── webproxy ────────────────┐        ┌──────────── simplecached ───────────┐
//! │                                          │        │                                     │
//! │  ChannelPool ──acquire──▶ ChannelLease   │        │  worker: SharedChannel::attach      │
//! │      ▲                        │          │  shm   │                │                    │
//! │      └────────release─────────┘          │◀══════▶│   ChunkWriter::publish ──▶ post     │
//! │     wait(producer-ready) / post(consumer-ready)   │   wait(consumer-ready)              │
//! └──────────────────────────────────────────┘        └─────────────────────────────────────┘
//! ```
//!
//! One chunk is in flight per channel at any time: the producer publishes a
//! chunk and posts producer-ready, the consumer reads it and posts
//! consumer-ready. Payload fields are only ever written by the side holding
//! the turn, so no lock lives inside the mapping.

pub mod channel;
pub mod layout;
pub mod pool;

pub use channel::{ChannelRole, SharedChannel, MAX_CHANNEL_NAME_LEN};
pub use layout::{usable_capacity, ChunkView, ChunkWriter, HEADER_SIZE};
pub use pool::{ChannelLease, ChannelPool};
