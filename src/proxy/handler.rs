//! Proxy Transfer Handler - consumer half of the chunk handshake
//!
//! One call to [`TransferHandler::handle`] serves one client request:
//!
//! 1. acquire a channel (fail fast when the pool is empty)
//! 2. announce channel/key/capacity to the cache daemon
//! 3. wait for the first chunk; an empty first chunk is a miss
//! 4. send the response header with the total size
//! 5. forward chunks, acknowledging each one, until the last-chunk flag
//! 6. return the channel to the pool
//!
//! The channel is held by a [`ChannelLease`](crate::shm::ChannelLease) so it
//! goes back to the pool on every path, exactly once. A transfer that stops
//! before the producer finished (timeout, overflow, protocol error) retires
//! the channel instead, so a late producer never writes into a channel that
//! serves the next request.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::control::{ControlClient, ControlRequest};
use crate::error::{Error, Result};
use crate::metrics;
use crate::shm::{ChannelLease, ChannelPool, SharedChannel};

/// Status carried by the response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    NotFound,
    Error,
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseStatus::Ok => write!(f, "OK"),
            ResponseStatus::NotFound => write!(f, "NOT_FOUND"),
            ResponseStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Client connection as seen by the handler.
///
/// Exactly one header is sent, before any body bytes.
pub trait ResponseSink {
    /// Send the response header.
    fn send_header(&mut self, status: ResponseStatus, content_length: u64) -> Result<()>;

    /// Send body bytes; may accept fewer than `buf.len()`.
    fn send_body(&mut self, buf: &[u8]) -> Result<usize>;

    /// The transfer failed after the header went out.
    fn abort(&mut self) {}
}

/// Sink that collects the response in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    /// Header, once sent
    pub header: Option<(ResponseStatus, u64)>,
    /// Body bytes received
    pub body: Vec<u8>,
    /// Size of every `send_body` call
    pub sends: Vec<usize>,
    /// Whether `abort` was called
    pub aborted: bool,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<ResponseStatus> {
        self.header.map(|(status, _)| status)
    }
}

impl ResponseSink for BufferSink {
    fn send_header(&mut self, status: ResponseStatus, content_length: u64) -> Result<()> {
        if self.header.is_some() {
            return Err(Error::ClientSendFailure("header already sent".into()));
        }
        self.header = Some((status, content_length));
        Ok(())
    }

    fn send_body(&mut self, buf: &[u8]) -> Result<usize> {
        if self.header.is_none() {
            return Err(Error::ClientSendFailure("body before header".into()));
        }
        self.body.extend_from_slice(buf);
        self.sends.push(buf.len());
        Ok(buf.len())
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}

/// Remembers whether the header went out so failures can be reported once.
struct TrackedSink<'a> {
    inner: &'a mut dyn ResponseSink,
    header_sent: bool,
}

impl<'a> TrackedSink<'a> {
    fn new(inner: &'a mut dyn ResponseSink) -> Self {
        Self {
            inner,
            header_sent: false,
        }
    }

    fn send_header(&mut self, status: ResponseStatus, content_length: u64) -> Result<()> {
        self.header_sent = true;
        self.inner
            .send_header(status, content_length)
            .map_err(into_client_failure)
    }

    /// Deliver the whole buffer, looping over partial sends.
    fn send_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let sent = self.inner.send_body(buf).map_err(into_client_failure)?;
            if sent == 0 {
                return Err(Error::ClientSendFailure("client accepted no bytes".into()));
            }
            buf = &buf[sent.min(buf.len())..];
        }
        Ok(())
    }

    fn report_failure(&mut self, err: &Error) {
        if self.header_sent {
            self.inner.abort();
            return;
        }
        let status = match err {
            Error::ContentMiss { .. } => ResponseStatus::NotFound,
            _ => ResponseStatus::Error,
        };
        if let Err(e) = self.send_header(status, 0) {
            warn!("Failed to send {} header: {}", status, e);
        }
    }
}

fn into_client_failure(err: Error) -> Error {
    match err {
        Error::ClientSendFailure(_) => err,
        other => Error::ClientSendFailure(other.to_string()),
    }
}

// =============================================================================
// TransferHandler
// =============================================================================

/// Serves client requests from the cache daemon over the channel pool.
#[derive(Debug, Clone)]
pub struct TransferHandler {
    pool: Arc<ChannelPool>,
    control: ControlClient,
    handshake_timeout: Option<Duration>,
}

impl TransferHandler {
    pub fn new(pool: Arc<ChannelPool>, control: ControlClient) -> Self {
        Self {
            pool,
            control,
            handshake_timeout: None,
        }
    }

    /// Build a handler using the control and timeout settings of `config`.
    pub fn from_config(pool: Arc<ChannelPool>, config: &ProxyConfig) -> Self {
        let control = ControlClient::new(&config.socket_path)
            .with_retry(config.connect_retries, config.retry_delay);
        Self::new(pool, control).with_handshake_timeout(config.handshake_timeout)
    }

    /// Bound every producer-ready wait; `None` waits forever.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Serve `key` to `sink`, returning the bytes forwarded.
    ///
    /// On failure the client has already been told: an error or not-found
    /// header if nothing was sent yet, otherwise [`ResponseSink::abort`].
    pub fn handle(&self, key: &str, sink: &mut dyn ResponseSink) -> Result<u64> {
        let span = info_span!("transfer", id = %Uuid::new_v4(), key);
        let _enter = span.enter();

        let mut sink = TrackedSink::new(sink);
        let result = self
            .pool
            .acquire()
            .and_then(|lease| self.transfer_leased(lease, key, &mut sink));

        match result {
            Ok(bytes) => {
                metrics::TRANSFERS_TOTAL.with_label_values(&["ok"]).inc();
                metrics::BYTES_FORWARDED_TOTAL.inc_by(bytes);
                info!(bytes, "Transfer complete");
                Ok(bytes)
            }
            Err(e) => {
                metrics::TRANSFERS_TOTAL
                    .with_label_values(&[e.outcome_label()])
                    .inc();
                match &e {
                    Error::ContentMiss { .. } => info!("Content not found"),
                    Error::NoChannelAvailable => warn!("No free shared memory channel"),
                    _ => error!("Transfer failed: {}", e),
                }
                sink.report_failure(&e);
                Err(e)
            }
        }
    }

    fn transfer_leased(
        &self,
        lease: ChannelLease<'_>,
        key: &str,
        sink: &mut TrackedSink<'_>,
    ) -> Result<u64> {
        let result = self.transfer(&lease, key, sink);
        match &result {
            Err(e) if leaves_handshake_open(e) => {
                warn!(channel = %lease.name(), "Retiring channel after abandoned transfer");
                lease.retire();
            }
            _ => drop(lease),
        }
        result
    }

    fn transfer(
        &self,
        channel: &SharedChannel,
        key: &str,
        sink: &mut TrackedSink<'_>,
    ) -> Result<u64> {
        // The channel already exists; the daemon finds it by name.
        let request = ControlRequest::new(channel.name(), key, channel.capacity());
        self.control.send(&request)?;

        debug!(channel = %channel.name(), "Waiting for first chunk");
        channel.wait_producer_ready(self.handshake_timeout)?;

        let first = channel.pending_chunk()?;
        if first.is_empty() {
            if first.last {
                return Err(Error::ContentMiss {
                    key: key.to_string(),
                });
            }
            return Err(Error::ProtocolViolation {
                channel: channel.name().to_string(),
                reason: "zero-length first chunk without last-chunk flag".into(),
            });
        }

        let total = channel.total_size();
        let mut client_error = sink.send_header(ResponseStatus::Ok, total).err();
        let mut forwarded = 0u64;

        loop {
            let chunk = channel.pending_chunk()?;
            debug!(len = chunk.len(), last = chunk.last, "Received chunk");

            if client_error.is_none() {
                match sink.send_all(chunk.data) {
                    Ok(()) => forwarded += chunk.len() as u64,
                    Err(e) => {
                        warn!("Client send failed; draining remaining chunks: {}", e);
                        client_error = Some(e);
                    }
                }
            }

            let last = chunk.last;
            channel.signal_consumed()?;
            if last {
                break;
            }
            channel.wait_producer_ready(self.handshake_timeout)?;
        }

        if let Some(e) = client_error {
            return Err(e);
        }
        if forwarded != total {
            warn!(forwarded, total, "Forwarded size differs from announced size");
        }
        Ok(forwarded)
    }
}

/// Whether the producer may still be mid-handshake after this failure.
///
/// Only a miss, a fully drained client failure and a request that never
/// reached the daemon leave the channel clean.
fn leaves_handshake_open(err: &Error) -> bool {
    !matches!(
        err,
        Error::ContentMiss { .. }
            | Error::ClientSendFailure(_)
            | Error::ChannelConnectFailure { .. }
    )
}
