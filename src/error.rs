//! Error types for the shared-memory cache

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the proxy or the cache daemon
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Shared Channel Errors
    // =========================================================================
    /// Shared memory region could not be created, sized or mapped
    #[error("Failed to initialise channel {name}: {reason}")]
    ChannelInit { name: String, reason: String },

    /// Existing shared memory region could not be opened or mapped
    #[error("Failed to attach channel {name}: {reason}")]
    ChannelAttach { name: String, reason: String },

    /// Semaphore operation failed
    #[error("Semaphore {op} failed: {source}")]
    Semaphore {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Consumer retired the channel while the producer was mid-transfer
    #[error("Consumer abandoned the transfer")]
    TransferAbandoned,

    /// Reported chunk length exceeds the usable buffer
    #[error("Chunk length {len} exceeds usable buffer of {max} bytes")]
    ChunkOverflow { len: usize, max: usize },

    // =========================================================================
    // Transfer Errors
    // =========================================================================
    /// Channel pool exhausted
    #[error("No shared memory channel available")]
    NoChannelAvailable,

    /// Control socket unreachable after bounded retries
    #[error("Cache daemon unreachable at {} after {attempts} attempts: {source}", path.display())]
    ChannelConnectFailure {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Content key not resolvable by the content store
    #[error("Content not found: {key}")]
    ContentMiss { key: String },

    /// Producer violated the chunk handshake
    #[error("Protocol violation on channel {channel}: {reason}")]
    ProtocolViolation { channel: String, reason: String },

    /// Producer did not signal within the configured handshake timeout
    #[error("Timed out after {timeout:?} waiting for channel {channel}")]
    HandshakeTimeout { channel: String, timeout: Duration },

    /// Forwarding bytes to the client failed
    #[error("Client send failed: {0}")]
    ClientSendFailure(String),
}

impl Error {
    /// Label used for the transfer outcome metric.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Error::NoChannelAvailable => "no_channel",
            Error::ChannelConnectFailure { .. } => "connect_failed",
            Error::ContentMiss { .. } => "not_found",
            Error::ChunkOverflow { .. } => "overflow",
            Error::ClientSendFailure(_) => "client_failed",
            Error::ProtocolViolation { .. } => "protocol_violation",
            Error::HandshakeTimeout { .. } => "timeout",
            Error::TransferAbandoned => "abandoned",
            _ => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(Error::NoChannelAvailable.outcome_label(), "no_channel");
        assert_eq!(
            Error::ContentMiss { key: "k".into() }.outcome_label(),
            "not_found"
        );
        assert_eq!(
            Error::ChunkOverflow { len: 10, max: 5 }.outcome_label(),
            "overflow"
        );
        assert_eq!(Error::Internal("x".into()).outcome_label(), "error");
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::ChannelConnectFailure {
            path: PathBuf::from("/tmp/cache_socket"),
            attempts: 5,
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/cache_socket"));
        assert!(msg.contains("5 attempts"));
    }
}
