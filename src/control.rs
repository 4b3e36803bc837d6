//! Control Socket Protocol
//!
//! The proxy announces a transfer to the cache daemon by writing one text
//! line over a Unix stream socket:
//!
//! ```text
//! <channel-name> <content-key> <channel-capacity>\n
//! ```
//!
//! and closing the connection. The key is percent-encoded on the wire so a
//! key holding whitespace stays a single token. There is no acknowledgment: the result of the
//! transfer is observed only through the shared channel handshake. The named
//! channel must therefore exist before the line is sent.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_CONNECT_RETRIES, DEFAULT_RETRY_DELAY};
use crate::error::{Error, Result};

/// Maximum accepted control request length; longer input is truncated
pub const MAX_REQUEST_LEN: usize = 6100;

/// Capacity assumed when the request omits it or it does not parse
pub const FALLBACK_CAPACITY: usize = DEFAULT_CHANNEL_CAPACITY;

/// One transfer announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    /// Shared channel name
    pub channel: String,
    /// Content key to resolve
    pub key: String,
    /// Channel capacity in bytes (header included)
    pub capacity: usize,
}

impl ControlRequest {
    pub fn new(channel: impl Into<String>, key: impl Into<String>, capacity: usize) -> Self {
        Self {
            channel: channel.into(),
            key: key.into(),
            capacity,
        }
    }

    /// Parse a request line.
    ///
    /// Returns `None` when the channel name or key is missing or the key is
    /// not valid percent-encoded UTF-8. A missing or malformed capacity falls
    /// back to [`FALLBACK_CAPACITY`].
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let channel = tokens.next()?;
        let key = urlencoding::decode(tokens.next()?).ok()?;
        if key.is_empty() {
            return None;
        }

        let capacity = tokens
            .next()
            .and_then(|t| t.parse::<usize>().ok())
            .filter(|c| *c > 0)
            .unwrap_or(FALLBACK_CAPACITY);

        Some(Self::new(channel, key.into_owned(), capacity))
    }

    /// Wire encoding, newline included.
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.channel,
            urlencoding::encode(&self.key),
            self.capacity
        )
    }
}

/// Read one request from an accepted control connection.
///
/// Reads up to the first newline, the end of the stream or
/// [`MAX_REQUEST_LEN`] - 1 bytes, whichever comes first. When the read times
/// out after some bytes arrived, those bytes are parsed as the request.
pub fn read_request(stream: &mut impl Read) -> Result<Option<ControlRequest>> {
    let mut reader = BufReader::new(stream.take((MAX_REQUEST_LEN - 1) as u64));
    let mut buf = Vec::with_capacity(256);
    match reader.read_until(b'\n', &mut buf) {
        Ok(_) => {}
        Err(e)
            if !buf.is_empty()
                && matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
        {
            debug!(len = buf.len(), "Control read timed out; using partial line");
        }
        Err(e) => return Err(e.into()),
    }
    if buf.is_empty() {
        return Ok(None);
    }
    Ok(ControlRequest::parse(&String::from_utf8_lossy(&buf)))
}

// =============================================================================
// Client
// =============================================================================

/// Sends control requests to the cache daemon.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    retries: u32,
    retry_delay: Duration,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            retries: DEFAULT_CONNECT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the connect retry policy.
    pub fn with_retry(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Connect (retrying while the daemon is not yet listening), write the
    /// request line, and close.
    pub fn send(&self, request: &ControlRequest) -> Result<()> {
        let mut stream = self.connect()?;
        stream.write_all(request.to_line().as_bytes())?;
        stream.flush()?;
        debug!(channel = %request.channel, key = %request.key, "Sent control request");
        Ok(())
    }

    fn connect(&self) -> Result<UnixStream> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match UnixStream::connect(&self.socket_path) {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt >= self.retries => {
                    return Err(Error::ChannelConnectFailure {
                        path: self.socket_path.clone(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(
                        path = %self.socket_path.display(),
                        attempt,
                        "Control socket connect failed: {}; retrying",
                        e
                    );
                    thread::sleep(self.retry_delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_parse_full_line() {
        let req = ControlRequest::parse("/proxy_shm_3 /courses/a.txt 8192\n").unwrap();
        assert_eq!(req, ControlRequest::new("/proxy_shm_3", "/courses/a.txt", 8192));
    }

    #[test]
    fn test_parse_missing_capacity_falls_back() {
        let req = ControlRequest::parse("/proxy_shm_0 a.txt\n").unwrap();
        assert_eq!(req.key, "a.txt");
        assert_eq!(req.capacity, FALLBACK_CAPACITY);

        let req = ControlRequest::parse("/proxy_shm_0 a.txt lots").unwrap();
        assert_eq!(req.capacity, FALLBACK_CAPACITY);

        let req = ControlRequest::parse("/proxy_shm_0 a.txt 0").unwrap();
        assert_eq!(req.capacity, FALLBACK_CAPACITY);
    }

    #[test]
    fn test_parse_malformed_is_dropped() {
        assert!(ControlRequest::parse("").is_none());
        assert!(ControlRequest::parse("\n").is_none());
        assert!(ControlRequest::parse("/proxy_shm_0\n").is_none());
    }

    #[test]
    fn test_line_encoding() {
        let req = ControlRequest::new("/proxy_shm_1", "b.bin", 5712);
        assert_eq!(req.to_line(), "/proxy_shm_1 b.bin 5712\n");
        assert_eq!(ControlRequest::parse(&req.to_line()), Some(req));
    }

    #[test]
    fn test_key_with_whitespace_stays_one_token() {
        let req = ControlRequest::new("/c0", "/with space\tand tab", 200);
        assert_eq!(req.to_line(), "/c0 %2Fwith%20space%09and%20tab 200\n");
        assert_eq!(ControlRequest::parse(&req.to_line()), Some(req));
    }

    #[test]
    fn test_parse_decodes_key() {
        let req = ControlRequest::parse("/c0 %2Fcourses%2F50%25.txt 9000\n").unwrap();
        assert_eq!(req.key, "/courses/50%.txt");
        assert_eq!(req.capacity, 9000);
        assert!(ControlRequest::parse("/c0 %FF 9000\n").is_none());
    }

    #[test]
    fn test_read_request_truncates_oversized_input() {
        let mut input = b"/proxy_shm_0 ".to_vec();
        input.extend(std::iter::repeat(b'k').take(MAX_REQUEST_LEN * 2));
        let req = read_request(&mut input.as_slice()).unwrap().unwrap();
        assert_eq!(req.key.len(), MAX_REQUEST_LEN - 1 - "/proxy_shm_0 ".len());
        assert_eq!(req.capacity, FALLBACK_CAPACITY);
    }

    #[test]
    fn test_read_request_empty_connection() {
        assert!(read_request(&mut &b""[..]).unwrap().is_none());
    }

    #[test]
    fn test_read_request_stops_at_newline() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"/c0 a.txt 100\n").unwrap();

        // The client keeps its end open; the line alone must be enough.
        let started = std::time::Instant::now();
        let req = read_request(&mut server).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(req, Some(ControlRequest::new("/c0", "a.txt", 100)));
        drop(client);
    }

    #[test]
    fn test_read_request_keeps_partial_line_on_timeout() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        server.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        client.write_all(b"/c0 a.txt 100").unwrap();

        let req = read_request(&mut server).unwrap();
        assert_eq!(req, Some(ControlRequest::new("/c0", "a.txt", 100)));

        let (_idle, mut server) = UnixStream::pair().unwrap();
        server.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        assert!(read_request(&mut server).is_err());
    }

    #[test]
    fn test_connect_failure_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let client = ControlClient::new(dir.path().join("absent.sock"))
            .with_retry(3, Duration::from_millis(1));

        let result = client.send(&ControlRequest::new("/c", "k", 5712));
        assert_matches!(result, Err(Error::ChannelConnectFailure { attempts: 3, .. }));
    }

    #[test]
    fn test_send_delivers_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let client = ControlClient::new(&path);
        let request = ControlRequest::new("/proxy_shm_2", "x/y.jpg", 9000);
        client.send(&request).unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        let received = read_request(&mut stream).unwrap();
        assert_eq!(received, Some(request));
    }
}
