//! # hpkv-protocol
//!
//! Wire protocol for the HPKV key-value service.
//!
//! This crate provides:
//! - WebSocket request/response envelopes correlated by `messageId`
//! - Key-change notifications pushed to token subscribers
//! - REST request/response payloads
//! - The [`RecordValue`] text/JSON tagged union
//! - A JSON text codec for WebSocket messages

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{Decoder, Encoder, Inbound};
pub use error::ProtocolError;
pub use message::{Notification, Operation, RecordValue, Request, Response};

/// Path of the WebSocket endpoint relative to the service base URL.
pub const WS_PATH: &str = "/ws";

/// Maximum accepted inbound message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
