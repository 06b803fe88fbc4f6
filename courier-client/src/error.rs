//! Client error types.

use courier_protocol::ProtocolError;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server error: {0}")]
    Server(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("no servers remaining in the pool")]
    NoServers,

    #[error("operation timed out")]
    Timeout,

    #[error("stale connection: {outstanding} pings outstanding")]
    StaleConnection { outstanding: u32 },

    #[error("fast producer: {pending} bytes pending")]
    FastProducer { pending: usize },

    #[error("payload of {size} bytes exceeds server maximum of {max}")]
    MaxPayloadExceeded { size: usize, max: usize },

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Returns whether this error terminates the current transport.
    ///
    /// Local conditions such as [`ClientError::FastProducer`] or a bounded
    /// wait expiring do not affect the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Protocol(_)
                | ClientError::Server(_)
                | ClientError::Auth(_)
                | ClientError::StaleConnection { .. }
                | ClientError::ConnectionClosed
        )
    }

    /// Classifies a server `-ERR` body, recognizing authorization failures.
    pub(crate) fn from_server_err(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("authorization") || lower.contains("authentication") {
            ClientError::Auth(message.to_string())
        } else {
            ClientError::Server(message.to_string())
        }
    }
}
