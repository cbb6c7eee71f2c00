//! Correlated request channel over a WebSocket connection.
//!
//! One channel owns one connection. Every request gets the next identifier
//! from a counter starting at 1 and parks a one-shot completion in the
//! pending map; a background reader task resolves it when the response with
//! the same `messageId` arrives. Responses may arrive in any order.

use crate::error::ClientError;
use crate::tls::create_tls_config;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hpkv_protocol::{
    Decoder, Encoder, Inbound, Notification, Operation, ProtocolError, Request, Response, WS_PATH,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Default capacity of the notification broadcast channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// TLS configuration for `wss://` endpoints.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the webpki roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self
    }
}

/// How the channel authenticates to the WebSocket endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// API key, passed as `?apiKey=`.
    ApiKey(String),
    /// Short-lived subscription token, passed as `?token=`.
    Token(String),
}

impl Credentials {
    fn query_pair(&self) -> (&'static str, &str) {
        match self {
            Credentials::ApiKey(key) => ("apiKey", key),
            Credentials::Token(token) => ("token", token),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiKey(_) => f.write_str("ApiKey(***)"),
            Credentials::Token(_) => f.write_str("Token(***)"),
        }
    }
}

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Service base URL (`http`, `https`, `ws`, `wss`, or bare host).
    pub base_url: String,
    pub credentials: Credentials,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Per-call timeout. `None` waits until a response, close, or disconnect.
    pub request_timeout: Option<Duration>,
    /// TLS configuration for `wss` endpoints (webpki roots when unset).
    pub tls: Option<TlsClientConfig>,
    /// Capacity of the notification broadcast channel.
    pub notification_capacity: usize,
}

impl ChannelConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_credentials(base_url, Credentials::ApiKey(api_key.into()))
    }

    /// Configuration for a notification subscriber authenticated by token.
    pub fn with_token(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_credentials(base_url, Credentials::Token(token.into()))
    }

    pub fn with_credentials(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            base_url: base_url.into(),
            credentials,
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            tls: None,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity.max(1);
        self
    }

    /// Returns the WebSocket endpoint URL, including credentials.
    pub fn endpoint(&self) -> Result<Url, ClientError> {
        websocket_url(&self.base_url, &self.credentials)
    }
}

/// Derives the WebSocket endpoint from a service base URL.
///
/// `http` maps to `ws`, `https` to `wss`, a bare host gets `wss`. The `/ws`
/// path is appended to any existing base path.
pub fn websocket_url(base_url: &str, credentials: &Credentials) -> Result<Url, ClientError> {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(ClientError::InvalidUrl("empty base URL".to_string()));
    }

    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else if base.contains("://") {
        return Err(ClientError::InvalidUrl(format!(
            "unsupported scheme in {}",
            base
        )));
    } else {
        format!("wss://{}", base)
    };

    let mut url = Url::parse(&ws_base).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    let path = format!("{}{}", url.path().trim_end_matches('/'), WS_PATH);
    url.set_path(&path);

    let (name, value) = credentials.query_pair();
    url.query_pairs_mut().append_pair(name, value);

    Ok(url)
}

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Disconnected => f.write_str("disconnected"),
            ChannelState::Connecting => f.write_str("connecting"),
            ChannelState::Open => f.write_str("open"),
            ChannelState::Closing => f.write_str("closing"),
        }
    }
}

/// An outstanding request awaiting its response.
struct PendingCall {
    /// Connection the request was written to.
    epoch: u64,
    tx: oneshot::Sender<Result<Response, ClientError>>,
}

/// State shared between callers and the reader task.
struct Shared {
    state: Mutex<ChannelState>,
    /// Incremented on every successful open.
    epoch: AtomicU64,
    /// Lock order: `state` before `pending`.
    pending: Mutex<HashMap<u64, PendingCall>>,
    notifications: broadcast::Sender<Notification>,
}

impl Shared {
    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    /// Registers a pending call on the current connection.
    fn register(
        &self,
        id: u64,
        tx: oneshot::Sender<Result<Response, ClientError>>,
    ) -> Result<u64, ClientError> {
        let state = self.state.lock();
        match *state {
            ChannelState::Open => {
                let epoch = self.epoch.load(Ordering::SeqCst);
                self.pending.lock().insert(id, PendingCall { epoch, tx });
                Ok(epoch)
            }
            ChannelState::Closing => Err(ClientError::ChannelClosed),
            _ => Err(ClientError::ConnectionLost),
        }
    }

    fn dispatch(&self, inbound: Result<Inbound, ProtocolError>) {
        match inbound {
            Ok(Inbound::Response(response)) => self.resolve(response),
            Ok(Inbound::Notification(notification)) => {
                tracing::debug!(
                    "read_loop: notification for key={:?}",
                    notification.key.as_deref()
                );
                // No receivers is fine
                let _ = self.notifications.send(notification);
            }
            Err(e) => {
                tracing::warn!("read_loop: dropping undecodable message: {}", e);
            }
        }
    }

    fn resolve(&self, response: Response) {
        let id = response.message_id;
        let Some(call) = self.pending.lock().remove(&id) else {
            tracing::debug!("read_loop: no pending call for id={}", id);
            return;
        };

        tracing::debug!("read_loop: dispatching response id={}", id);
        let outcome = match response.remote_error() {
            Some(message) => Err(ClientError::Remote(message.to_string())),
            None => Ok(response),
        };
        // The caller may have given up (timeout)
        let _ = call.tx.send(outcome);
    }

    /// Fails every pending call registered on the given connection.
    fn fail_epoch(&self, epoch: u64, make_err: fn() -> ClientError) -> usize {
        let mut pending = self.pending.lock();
        let ids: Vec<u64> = pending
            .iter()
            .filter(|(_, call)| call.epoch == epoch)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(call) = pending.remove(id) {
                let _ = call.tx.send(Err(make_err()));
            }
        }
        ids.len()
    }

    fn fail_all(&self, make_err: fn() -> ClientError) -> usize {
        let drained: Vec<PendingCall> = self.pending.lock().drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.tx.send(Err(make_err()));
        }
        count
    }

    /// Handles the end of a connection's read loop.
    fn connection_lost(&self, epoch: u64) {
        {
            let mut state = self.state.lock();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                // A newer connection has replaced this one
                return;
            }
            if *state == ChannelState::Closing {
                // close() rejects the pending calls itself
                return;
            }
            *state = ChannelState::Disconnected;
        }

        let failed = self.fail_epoch(epoch, || ClientError::ConnectionLost);
        tracing::warn!("Connection lost ({} pending call(s) failed)", failed);
    }
}

/// Whether a service error message reports a missing record.
fn is_not_found_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains("not found")
}

/// Reads and dispatches inbound messages until the connection ends.
async fn read_loop(shared: Arc<Shared>, mut source: WsSource, epoch: u64) {
    tracing::debug!("read_loop started (epoch={})", epoch);

    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Text(text)) => shared.dispatch(Decoder::decode_inbound(text.as_str())),
            Ok(Message::Binary(data)) => shared.dispatch(Decoder::decode_inbound_bytes(&data)),
            Ok(Message::Close(frame)) => {
                tracing::debug!("read_loop: close frame received: {:?}", frame);
                break;
            }
            // Pings are answered by the transport
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("read_loop: transport error: {}", e);
                break;
            }
        }
    }

    shared.connection_lost(epoch);
}

/// A correlated request channel to one HPKV endpoint.
pub struct Channel {
    config: ChannelConfig,
    shared: Arc<Shared>,
    /// Write half of the socket.
    writer: tokio::sync::Mutex<Option<WsSink>>,
    /// Background reader for the current connection.
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Serializes open() and close().
    lifecycle: tokio::sync::Mutex<()>,
    /// Next request ID.
    next_id: AtomicU64,
}

impl Channel {
    /// Creates a new channel (not yet connected).
    pub fn new(config: ChannelConfig) -> Self {
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState::Disconnected),
                epoch: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                notifications,
            }),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Returns the number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Subscribes to key-change notifications pushed by the service.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.shared.notifications.subscribe()
    }

    /// Establishes the connection and starts the reader task.
    ///
    /// Returns immediately if the channel is already open.
    pub async fn open(&self) -> Result<(), ClientError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_open() {
            return Ok(());
        }

        self.shared.set_state(ChannelState::Connecting);
        match self.connect().await {
            Ok(stream) => {
                let (sink, source) = stream.split();
                *self.writer.lock().await = Some(sink);

                let epoch = {
                    let mut state = self.shared.state.lock();
                    let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    *state = ChannelState::Open;
                    epoch
                };

                let handle = tokio::spawn(read_loop(self.shared.clone(), source, epoch));
                if let Some(previous) = self.reader.lock().replace(handle) {
                    previous.abort();
                }

                tracing::info!("Channel open (epoch={})", epoch);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(ChannelState::Disconnected);
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<WsStream, ClientError> {
        let url = self
            .config
            .endpoint()
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        tracing::debug!(
            "Connecting to {}://{}{}...",
            url.scheme(),
            url.host_str().unwrap_or(""),
            url.path()
        );

        let connector = if url.scheme() == "wss" {
            let tls = self.config.tls.clone().unwrap_or_default();
            let tls_config =
                create_tls_config(&tls).map_err(|e| ClientError::Connection(e.to_string()))?;
            Some(Connector::Rustls(tls_config))
        } else {
            None
        };

        let (stream, _response) = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async_tls_with_config(url.as_str(), None, true, connector),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Connection("connect timeout".to_string())
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Connection(e.to_string())
        })?;

        Ok(stream)
    }

    /// Sends a request and waits for the matching response.
    ///
    /// A channel that is not open is reopened first; if that fails the call
    /// fails with [`ClientError::Connection`] without registering anything.
    /// A response carrying a non-empty `error` fails with
    /// [`ClientError::Remote`], or [`ClientError::NotFound`] when the service
    /// reports a missing record.
    pub async fn send(
        &self,
        op: Operation,
        key: &str,
        value: Option<String>,
    ) -> Result<Response, ClientError> {
        if !self.is_open() {
            tracing::debug!("send() on {} channel, opening", self.state());
            self.open().await?;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = Request::new(id, op, key);
        if let Some(value) = value {
            request = request.with_value(value);
        }
        let encoded = Encoder::encode_request(&request)?;

        let (tx, rx) = oneshot::channel();
        self.shared.register(id, tx)?;

        let sent = {
            let mut writer_guard = self.writer.lock().await;
            match writer_guard.as_mut() {
                Some(writer) => writer
                    .send(Message::Text(encoded.into()))
                    .await
                    .map_err(|e| e.to_string()),
                None => Err("no writer".to_string()),
            }
        };
        if let Err(e) = sent {
            tracing::debug!("Request id={} could not be written: {}", id, e);
            if self.shared.pending.lock().remove(&id).is_none() {
                // Already rejected by close() or a lost connection
                return rx.await.unwrap_or(Err(ClientError::ChannelClosed));
            }
            if self.shared.state() == ChannelState::Closing {
                return Err(ClientError::ChannelClosed);
            }
            return Err(ClientError::ConnectionLost);
        }
        tracing::debug!("Request id={} op={} sent, waiting for response...", id, op);

        let outcome = match self.config.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::debug!("Request id={} timed out", id);
                    self.shared.pending.lock().remove(&id);
                    return Err(ClientError::Timeout);
                }
            },
            None => rx.await,
        };

        match outcome.map_err(|_| ClientError::ChannelClosed)? {
            Err(ClientError::Remote(message)) if is_not_found_message(&message) => {
                Err(ClientError::NotFound(key.to_string()))
            }
            other => other,
        }
    }

    /// Closes the connection, failing outstanding calls with
    /// [`ClientError::ChannelClosed`].
    pub async fn close(&self) -> Result<(), ClientError> {
        let _lifecycle = self.lifecycle.lock().await;
        tracing::debug!("Closing channel...");

        self.shared.set_state(ChannelState::Closing);

        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            tracing::debug!("Sending close frame");
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
        }

        let failed = self.shared.fail_all(|| ClientError::ChannelClosed);
        tracing::debug!("Rejected {} pending call(s)", failed);

        self.shared.set_state(ChannelState::Disconnected);
        tracing::debug!("Channel closed");
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}
