//! # hpkv-client
//!
//! Client library for HPKV.
//!
//! This crate provides:
//! - A correlated request channel over WebSocket ([`Channel`])
//! - A record facade with fetch/insert/update/remove ([`Client`])
//! - A REST client including atomic increment and range scans ([`RestClient`])
//! - Optional TLS configuration for `wss` endpoints

pub mod client;
pub mod connection;
pub mod error;
pub mod rest;
pub mod tls;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::Client;
pub use connection::{
    websocket_url, Channel, ChannelConfig, ChannelState, Credentials, TlsClientConfig,
};
pub use error::ClientError;
pub use hpkv_protocol::{Notification, Operation, RecordValue};
pub use rest::RestClient;
