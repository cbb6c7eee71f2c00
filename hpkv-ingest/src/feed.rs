//! Market data feed subscriptions.
//!
//! Each symbol gets its own WebSocket connection to the feed. A subscription
//! sends `{"type":"subscribe","symbol":..}` after connecting, keeps the
//! connection alive with `{"type":"ping"}`, forwards the first trade of every
//! `trade` message, and reconnects according to its [`ReconnectPolicy`].

use crate::config::{Config, ReconnectConfig, ReconnectPolicyKind};
use crate::error::IngestError;
use futures_util::{SinkExt, StreamExt};
use hpkv_client::tls::create_tls_config;
use hpkv_client::TlsClientConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Feed messages
// ============================================================================

/// A single trade reported by the feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Trade {
    #[serde(rename = "s", default)]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: f64,
    #[serde(rename = "v", default)]
    pub volume: f64,
    /// Trade time in milliseconds since the Unix epoch.
    #[serde(rename = "t", default)]
    pub timestamp: i64,
}

/// Inbound feed message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedMessage {
    Trade {
        #[serde(default)]
        data: Vec<Trade>,
    },
    Ping,
    Error {
        #[serde(rename = "msg", default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

impl FeedMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Returns the first trade of a `trade` message.
    pub fn first_trade(self) -> Option<Trade> {
        match self {
            FeedMessage::Trade { data } => data.into_iter().next(),
            _ => None,
        }
    }
}

/// Outbound feed command.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedCommand<'a> {
    Subscribe { symbol: &'a str },
    Unsubscribe { symbol: &'a str },
    Ping,
}

impl FeedCommand<'_> {
    pub fn to_message(&self) -> Result<Message, IngestError> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

/// Builds the feed endpoint with the token as query parameter.
pub fn feed_url(base: &str, token: &str) -> Result<Url, IngestError> {
    let mut url = Url::parse(base.trim()).map_err(|e| IngestError::InvalidFeedUrl(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(IngestError::InvalidFeedUrl(format!(
                "unsupported scheme {}",
                other
            )))
        }
    }
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

// ============================================================================
// Reconnection
// ============================================================================

/// Delay schedule between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed { delay: Duration },
    Exponential { base: Duration, max: Duration },
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        match config.policy {
            ReconnectPolicyKind::Fixed => ReconnectPolicy::Fixed {
                delay: config.delay(),
            },
            ReconnectPolicyKind::Exponential => ReconnectPolicy::Exponential {
                base: config.delay(),
                max: config.max_delay(),
            },
        }
    }

    /// Delay before the given (1-based) consecutive attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed { delay } => delay,
            ReconnectPolicy::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

/// Tracks consecutive failures for one feed.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    max_attempts: Option<u32>,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy, max_attempts: Option<u32>) -> Self {
        Self {
            policy,
            max_attempts,
            failures: 0,
        }
    }

    /// Records a failure and returns the delay before the next attempt, or
    /// `None` once `max_attempts` consecutive failures have been reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if let Some(max) = self.max_attempts {
            if self.failures >= max {
                return None;
            }
        }
        Some(self.policy.delay_for(self.failures))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Settings shared by all feed subscriptions of a service.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Feed endpoint including the token.
    pub url: Url,
    pub symbols: Vec<String>,
    pub ping_interval: Duration,
    pub policy: ReconnectPolicy,
    pub max_attempts: Option<u32>,
    /// Prefix of the record keys prices are written to.
    pub key_prefix: String,
}

impl FeedSettings {
    pub fn from_config(config: &Config) -> Result<Self, IngestError> {
        Ok(Self {
            url: feed_url(&config.feed.url, &config.feed.token)?,
            symbols: config.feed.symbols.clone(),
            ping_interval: config.feed.ping_interval(),
            policy: ReconnectPolicy::from_config(&config.reconnect),
            max_attempts: config.reconnect.max_attempts,
            key_prefix: config.hpkv.key_prefix.clone(),
        })
    }

    /// Returns the record key for a symbol.
    pub fn key_for(&self, symbol: &str) -> String {
        format!("{}{}", self.key_prefix, symbol)
    }
}

/// Events reported by a running subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Connected,
    Trade(Trade),
    Disconnected {
        error: String,
        /// Delay before the next attempt; `None` when the feed gives up.
        retry_in: Option<Duration>,
    },
}

/// Subscription to one symbol's trades.
pub struct FeedSubscription {
    symbol: String,
    url: Url,
    ping_interval: Duration,
    backoff: Backoff,
}

impl FeedSubscription {
    pub fn new(symbol: impl Into<String>, settings: &FeedSettings) -> Self {
        Self {
            symbol: symbol.into(),
            url: settings.url.clone(),
            ping_interval: settings.ping_interval,
            backoff: Backoff::new(settings.policy, settings.max_attempts),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Runs until `shutdown` flips, the event receiver goes away, or the
    /// reconnect policy gives up.
    pub async fn run(mut self, events: mpsc::Sender<FeedEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let error = match self.run_connection(&events, &mut shutdown).await {
                Ok(()) => break,
                Err(e) => e,
            };

            let retry_in = if error.is_retryable() {
                self.backoff.next_delay()
            } else {
                None
            };
            tracing::warn!(
                "Feed for {} disconnected: {} (retry in {:?})",
                self.symbol,
                error,
                retry_in
            );
            let disconnected = FeedEvent::Disconnected {
                error: error.to_string(),
                retry_in,
            };
            if events.send(disconnected).await.is_err() {
                break;
            }

            let Some(delay) = retry_in else {
                tracing::error!(
                    "Feed for {} stopped after {} failed attempt(s)",
                    self.symbol,
                    self.backoff.failures()
                );
                break;
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        tracing::debug!("Feed for {} finished", self.symbol);
    }

    /// Drives one connection. `Ok` means a deliberate stop.
    async fn run_connection(
        &mut self,
        events: &mpsc::Sender<FeedEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), IngestError> {
        tracing::info!("Starting connection for {}", self.symbol);

        let connector = if self.url.scheme() == "wss" {
            let tls = create_tls_config(&TlsClientConfig::default())?;
            Some(Connector::Rustls(tls))
        } else {
            None
        };
        let (stream, _) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            connect_async_tls_with_config(self.url.as_str(), None, true, connector),
        )
        .await
        .map_err(|_| IngestError::FeedConnect("connect timeout".to_string()))?
        .map_err(|e| IngestError::FeedConnect(e.to_string()))?;

        tracing::info!("Connected to feed for {}", self.symbol);
        self.backoff.reset();
        if events.send(FeedEvent::Connected).await.is_err() {
            return Ok(());
        }

        let (mut write, mut read) = stream.split();
        write
            .send(
                FeedCommand::Subscribe {
                    symbol: &self.symbol,
                }
                .to_message()?,
            )
            .await?;
        tracing::debug!("Subscribed to {}", self.symbol);

        let mut keep_alive =
            tokio::time::interval_at(Instant::now() + self.ping_interval, self.ping_interval);

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !self.handle_text(text.as_str(), events).await {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!("Feed for {} sent close: {:?}", self.symbol, frame);
                        return Err(IngestError::FeedClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(IngestError::FeedClosed),
                },
                _ = keep_alive.tick() => {
                    write.send(FeedCommand::Ping.to_message()?).await?;
                }
                _ = shutdown.changed() => {
                    tracing::info!("Stopping connection for {}", self.symbol);
                    let _ = write
                        .send(FeedCommand::Unsubscribe { symbol: &self.symbol }.to_message()?)
                        .await;
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    /// Returns false once nobody listens for events.
    async fn handle_text(&self, text: &str, events: &mpsc::Sender<FeedEvent>) -> bool {
        match FeedMessage::parse(text) {
            Ok(FeedMessage::Trade { data }) => match data.into_iter().next() {
                Some(trade) => {
                    tracing::debug!("Received price for {}: {}", self.symbol, trade.price);
                    events.send(FeedEvent::Trade(trade)).await.is_ok()
                }
                None => true,
            },
            Ok(FeedMessage::Error { message }) => {
                tracing::warn!("Feed error for {}: {}", self.symbol, message);
                true
            }
            Ok(FeedMessage::Ping) | Ok(FeedMessage::Other) => true,
            Err(e) => {
                tracing::warn!("Unparseable feed message for {}: {}", self.symbol, e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFeed;
    use serde_json::json;

    fn settings(url: &str, policy: ReconnectPolicy) -> FeedSettings {
        FeedSettings {
            url: feed_url(url, "feed-token").unwrap(),
            symbols: vec!["AAPL".to_string()],
            ping_interval: Duration::from_secs(30),
            policy,
            max_attempts: None,
            key_prefix: "stock:".to_string(),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<FeedEvent>) -> FeedEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("feed event")
            .expect("feed channel open")
    }

    #[test]
    fn test_parse_trade_message() {
        let msg = FeedMessage::parse(
            r#"{"type":"trade","data":[{"s":"AAPL","p":189.25,"v":10,"t":1700000000000,"c":["1"]},{"s":"AAPL","p":190.0,"v":1,"t":1700000000001}]}"#,
        )
        .unwrap();
        let trade = msg.first_trade().unwrap();
        assert_eq!(trade.symbol, "AAPL");
        assert_eq!(trade.price, 189.25);
        assert_eq!(trade.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_parse_other_messages() {
        assert_eq!(FeedMessage::parse(r#"{"type":"ping"}"#).unwrap(), FeedMessage::Ping);
        assert_eq!(
            FeedMessage::parse(r#"{"type":"error","msg":"Invalid token"}"#).unwrap(),
            FeedMessage::Error {
                message: "Invalid token".to_string()
            }
        );
        assert_eq!(
            FeedMessage::parse(r#"{"type":"news","data":[]}"#).unwrap(),
            FeedMessage::Other
        );
        assert_eq!(
            FeedMessage::parse(r#"{"type":"trade"}"#).unwrap().first_trade(),
            None
        );
        assert!(FeedMessage::parse("not json").is_err());
    }

    #[test]
    fn test_feed_commands() {
        let subscribe = serde_json::to_value(FeedCommand::Subscribe { symbol: "AAPL" }).unwrap();
        assert_eq!(subscribe, json!({"type": "subscribe", "symbol": "AAPL"}));
        let ping = serde_json::to_value(FeedCommand::Ping).unwrap();
        assert_eq!(ping, json!({"type": "ping"}));
    }

    #[test]
    fn test_feed_url() {
        let url = feed_url("wss://ws.finnhub.io", "abc").unwrap();
        assert_eq!(url.as_str(), "wss://ws.finnhub.io/?token=abc");
        assert!(matches!(
            feed_url("https://ws.finnhub.io", "abc"),
            Err(IngestError::InvalidFeedUrl(_))
        ));
    }

    #[test]
    fn test_fixed_policy() {
        let policy = ReconnectPolicy::Fixed {
            delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(50), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_policy() {
        let policy = ReconnectPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };
        let delays: Vec<u64> = (1..=8).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_gives_up_and_resets() {
        let policy = ReconnectPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };
        let mut backoff = Backoff::new(policy, Some(3));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));

        let mut unbounded = Backoff::new(policy, None);
        for _ in 0..100 {
            assert!(unbounded.next_delay().is_some());
        }
    }

    #[test]
    fn test_policy_from_config() {
        let config = ReconnectConfig {
            policy: ReconnectPolicyKind::Fixed,
            ..Default::default()
        };
        assert_eq!(
            ReconnectPolicy::from_config(&config),
            ReconnectPolicy::Fixed {
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(
            ReconnectPolicy::from_config(&ReconnectConfig::default()),
            ReconnectPolicy::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(60)
            }
        );
    }

    #[tokio::test]
    async fn test_subscribes_and_forwards_trades() {
        let feed = MockFeed::start().await;
        let settings = settings(
            &feed.url(),
            ReconnectPolicy::Fixed {
                delay: Duration::from_millis(10),
            },
        );
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(FeedSubscription::new("AAPL", &settings).run(events_tx, shutdown_rx));

        assert_eq!(next_event(&mut events_rx).await, FeedEvent::Connected);
        feed.wait_for_subscriptions(1).await;
        assert_eq!(
            feed.received()[0],
            json!({"type": "subscribe", "symbol": "AAPL"})
        );
        assert_eq!(feed.last_token().as_deref(), Some("feed-token"));

        feed.send_trade("AAPL", 189.25);
        match next_event(&mut events_rx).await {
            FeedEvent::Trade(trade) => assert_eq!(trade.price, 189.25),
            other => panic!("unexpected event: {:?}", other),
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_and_resubscribes() {
        let feed = MockFeed::start().await;
        let settings = settings(
            &feed.url(),
            ReconnectPolicy::Fixed {
                delay: Duration::from_millis(10),
            },
        );
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _task = tokio::spawn(FeedSubscription::new("AAPL", &settings).run(events_tx, shutdown_rx));

        assert_eq!(next_event(&mut events_rx).await, FeedEvent::Connected);
        feed.wait_for_subscriptions(1).await;

        feed.drop_connections();
        match next_event(&mut events_rx).await {
            FeedEvent::Disconnected { retry_in, .. } => {
                assert_eq!(retry_in, Some(Duration::from_millis(10)))
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(next_event(&mut events_rx).await, FeedEvent::Connected);
        feed.wait_for_subscriptions(2).await;
        assert_eq!(feed.connection_count(), 2);

        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_sends_keep_alive_pings() {
        let feed = MockFeed::start().await;
        let mut settings = settings(
            &feed.url(),
            ReconnectPolicy::Fixed {
                delay: Duration::from_millis(10),
            },
        );
        settings.ping_interval = Duration::from_millis(20);
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _task = tokio::spawn(FeedSubscription::new("AAPL", &settings).run(events_tx, shutdown_rx));

        feed.wait_for_messages(3).await;
        let received = feed.received();
        assert!(received[1..].iter().all(|m| m == &json!({"type": "ping"})));

        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let addr = hpkv_client::testing::unused_addr().await;
        let mut settings = settings(
            &format!("ws://{}", addr),
            ReconnectPolicy::Fixed {
                delay: Duration::from_millis(1),
            },
        );
        settings.max_attempts = Some(2);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(FeedSubscription::new("AAPL", &settings).run(events_tx, shutdown_rx));

        match next_event(&mut events_rx).await {
            FeedEvent::Disconnected { retry_in, .. } => assert!(retry_in.is_some()),
            other => panic!("unexpected event: {:?}", other),
        }
        match next_event(&mut events_rx).await {
            FeedEvent::Disconnected { retry_in, .. } => assert_eq!(retry_in, None),
            other => panic!("unexpected event: {:?}", other),
        }
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
