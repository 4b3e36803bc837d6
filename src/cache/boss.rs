//! Cache Boss - control socket acceptor
//!
//! Accepts one connection at a time, reads a single request line, turns it
//! into a [`TransferTask`] and hands it to the worker pool. Nothing is ever
//! written back: a malformed request is dropped and the proxy observes the
//! outcome only through the shared channel.

use std::os::unix::net::UnixListener;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::queue::TransferTask;
use super::DaemonContext;
use crate::control;

/// Bound on how long a single control connection may take to deliver its line
pub const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Boss thread body: accept until shutdown.
pub(crate) fn boss_loop(ctx: &DaemonContext, listener: UnixListener) {
    info!(socket = %ctx.config.socket_path.display(), "Cache boss accepting control connections");

    for stream in listener.incoming() {
        if ctx.is_shutting_down() {
            break;
        }

        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Control accept failed: {}", e);
                continue;
            }
        };

        if let Err(e) = stream.set_read_timeout(Some(CONTROL_READ_TIMEOUT)) {
            warn!("Failed to set control read timeout: {}", e);
        }

        match control::read_request(&mut stream) {
            Ok(Some(request)) => {
                debug!(
                    channel = %request.channel,
                    key = %request.key,
                    capacity = request.capacity,
                    "Received control request"
                );
                if !ctx.queue.push(TransferTask::from(request)) {
                    break;
                }
            }
            Ok(None) => debug!("Dropped malformed control request"),
            Err(e) => warn!("Failed to read control request: {}", e),
        }
    }

    info!("Cache boss stopped");
}
