//! High-level record API.

use crate::connection::{Channel, ChannelConfig};
use crate::error::ClientError;
use hpkv_protocol::{Notification, Operation, RecordValue};
use std::sync::Arc;
use tokio::sync::broadcast;

/// High-level client for HPKV records over a WebSocket channel.
///
/// Record operations never raise: failures are logged and reported as
/// `None` or `false`. Use [`Client::channel`] for the raw `Result` API.
#[derive(Clone)]
pub struct Client {
    channel: Arc<Channel>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            channel: Arc::new(Channel::new(config)),
        }
    }

    /// Opens the channel.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.channel.open().await
    }

    /// Returns whether the channel is open.
    pub fn is_connected(&self) -> bool {
        self.channel.is_open()
    }

    /// Closes the channel.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.channel.close().await
    }

    /// Returns the underlying channel.
    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    /// Subscribes to key-change notifications.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.channel.subscribe_notifications()
    }

    // =========================================================================
    // Record operations
    // =========================================================================

    /// Reads a record. Missing keys and failures both yield `None`.
    pub async fn fetch(&self, key: &str) -> Option<RecordValue> {
        match self.channel.send(Operation::Get, key, None).await {
            Ok(response) => match response.value {
                Some(raw) => Some(RecordValue::decode(&raw)),
                None => {
                    tracing::debug!("fetch {}: response carried no value", key);
                    None
                }
            },
            Err(e) if e.is_not_found() => {
                tracing::debug!("fetch {}: {}", key, e);
                None
            }
            Err(e) => {
                tracing::warn!("fetch {} failed: {}", key, e);
                None
            }
        }
    }

    /// Inserts or replaces a record.
    pub async fn insert(&self, key: &str, value: impl Into<RecordValue>) -> bool {
        self.write(Operation::Insert, key, value.into()).await
    }

    /// Updates a record.
    ///
    /// With `partial`, the service merges the supplied fields into the stored
    /// object. Without it the stored value is replaced.
    pub async fn update(&self, key: &str, value: impl Into<RecordValue>, partial: bool) -> bool {
        let op = if partial {
            Operation::Update
        } else {
            Operation::Insert
        };
        self.write(op, key, value.into()).await
    }

    /// Deletes a record.
    pub async fn remove(&self, key: &str) -> bool {
        match self.channel.send(Operation::Delete, key, None).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("remove {} failed: {}", key, e);
                false
            }
        }
    }

    async fn write(&self, op: Operation, key: &str, value: RecordValue) -> bool {
        match self.channel.send(op, key, Some(value.encode())).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("{} {} failed: {}", op, key, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockServer;
    use serde_json::json;

    #[test]
    fn test_client_creation() {
        let client = Client::new(ChannelConfig::new("http://localhost:3000", "key"));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_fetch_before_insert_is_none() {
        let server = MockServer::start().await;
        let client = Client::new(server.channel_config());

        assert_eq!(client.fetch("user:1").await, None);
    }

    #[tokio::test]
    async fn test_insert_then_fetch_round_trips_json() {
        let server = MockServer::start().await;
        let client = Client::new(server.channel_config());
        let user = json!({"name": "John Doe", "age": 30});

        assert!(client.insert("user:1", user.clone()).await);
        assert_eq!(client.fetch("user:1").await, Some(RecordValue::json(user)));
    }

    #[tokio::test]
    async fn test_text_values_stay_text() {
        let server = MockServer::start().await;
        let client = Client::new(server.channel_config());

        assert!(client.insert("greeting", "hello world").await);
        assert_eq!(
            client.fetch("greeting").await,
            Some(RecordValue::text("hello world"))
        );
        assert_eq!(server.stored("greeting").as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn test_partial_update_merges_fields() {
        let server = MockServer::start().await;
        let client = Client::new(server.channel_config());

        assert!(
            client
                .insert("user:1", json!({"name": "John Doe", "age": 30}))
                .await
        );
        assert!(client.update("user:1", json!({"age": 31}), true).await);

        assert_eq!(
            client.fetch("user:1").await,
            Some(RecordValue::json(json!({"name": "John Doe", "age": 31})))
        );
        let ops: Vec<Operation> = server.requests().iter().map(|r| r.op).collect();
        assert_eq!(ops[1], Operation::Update);
    }

    #[tokio::test]
    async fn test_full_update_replaces_value() {
        let server = MockServer::start().await;
        let client = Client::new(server.channel_config());

        client
            .insert("user:1", json!({"name": "John Doe", "age": 30}))
            .await;
        assert!(client.update("user:1", json!({"age": 31}), false).await);

        assert_eq!(
            client.fetch("user:1").await,
            Some(RecordValue::json(json!({"age": 31})))
        );
    }

    #[tokio::test]
    async fn test_partial_update_of_missing_key_fails() {
        let server = MockServer::start().await;
        let client = Client::new(server.channel_config());

        assert!(!client.update("user:9", json!({"age": 1}), true).await);
    }

    #[tokio::test]
    async fn test_remove() {
        let server = MockServer::start().await;
        let client = Client::new(server.channel_config());

        client.insert("user:1", "x").await;
        assert!(client.remove("user:1").await);
        assert_eq!(client.fetch("user:1").await, None);
        assert!(!client.remove("user:1").await);
    }

    #[tokio::test]
    async fn test_operations_report_failure_when_unreachable() {
        let addr = crate::testing::unused_addr().await;
        let client = Client::new(ChannelConfig::new(format!("http://{}", addr), "k"));

        assert_eq!(client.fetch("user:1").await, None);
        assert!(!client.insert("user:1", "x").await);
        assert!(!client.remove("user:1").await);
    }
}
