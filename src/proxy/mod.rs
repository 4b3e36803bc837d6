//! Web proxy side
//!
//! The proxy owns the channel pool. For each client request it hands a
//! channel to the cache daemon over the control socket and forwards what
//! arrives through it:
//!
//! ```text
//! client ──▶ server (hyper) ──▶ TransferHandler ──▶ ChannelPool::acquire
//!                                     │
//!                                     ├──▶ control socket ──▶ cache daemon
//!                                     │
//!                                     └◀── shared channel chunks ◀── worker
//! ```

pub mod handler;
pub mod server;

pub use handler::{BufferSink, ResponseSink, ResponseStatus, TransferHandler};
pub use server::serve;
