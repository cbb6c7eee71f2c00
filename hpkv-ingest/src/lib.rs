//! # hpkv-ingest
//!
//! Stock price ingestion into HPKV.
//!
//! This crate provides:
//! - Layered configuration (defaults, YAML file, environment)
//! - Per-symbol market data feed subscriptions with reconnection policies
//! - An ingestion service writing each trade price to `stock:{SYMBOL}`
//! - Prometheus metrics and an HTTP endpoint to scrape them

pub mod config;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod service;

#[cfg(test)]
mod testing;

pub use config::{
    Config, ConfigError, FeedConfig, HpkvConfig, MetricsConfig, ReconnectConfig,
    ReconnectPolicyKind,
};
pub use error::IngestError;
pub use feed::{Backoff, FeedEvent, FeedSettings, FeedSubscription, ReconnectPolicy, Trade};
pub use metrics::{run_metrics_server, Metrics};
pub use service::{IngestionService, PriceStore};
