//! Ingestion error types.

use thiserror::Error;

/// Ingestion errors.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("client error: {0}")]
    Client(#[from] hpkv_client::ClientError),

    #[error("feed connection failed: {0}")]
    FeedConnect(String),

    #[error("feed transport error: {0}")]
    FeedTransport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("feed closed the connection")]
    FeedClosed,

    #[error("invalid feed URL: {0}")]
    InvalidFeedUrl(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("price write rejected for {0}")]
    WriteRejected(String),

    #[error("symbol {0} is already running")]
    AlreadyRunning(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl IngestError {
    /// Returns whether the feed should reconnect after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::FeedConnect(_) | IngestError::FeedTransport(_) | IngestError::FeedClosed
        )
    }
}
