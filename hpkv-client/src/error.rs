//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport could not be established.
    #[error("connection error: {0}")]
    Connection(String),

    /// An established connection dropped while the call was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// The channel was closed by its owner.
    #[error("channel closed")]
    ChannelClosed,

    /// The service answered with a non-empty `error` field.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("request timeout")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(#[from] hpkv_protocol::ProtocolError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Connection(_) => true,
            ClientError::ConnectionLost => true,
            ClientError::Timeout => true,
            ClientError::Http(e) => e.is_connect() || e.is_timeout(),
            ClientError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns whether this error means the key does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::NotFound(_) => true,
            ClientError::HttpStatus { status, .. } => *status == 404,
            _ => false,
        }
    }
}
