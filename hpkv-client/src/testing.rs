//! In-process mock HPKV servers for tests and benchmarks.
//!
//! [`MockServer`] speaks the WebSocket protocol against an in-memory store;
//! [`MockRest`] serves the REST endpoints. Both bind `127.0.0.1:0`.

use crate::connection::ChannelConfig;
use crate::rest::RestClient;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hpkv_protocol::message::{
    AtomicIncrementParams, RangeRecord, RangeResult, RecordPayload, TokenParams,
};
use hpkv_protocol::{Decoder, Encoder, Notification, Operation, Request, Response};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

/// API key accepted by the mock servers.
pub const MOCK_API_KEY: &str = "test-api-key";

const NOT_FOUND: &str = "Record not found";

/// Returns a local address with nothing listening on it.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    listener.local_addr().expect("probe address")
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Merges the fields of `patch` into `existing` when both are JSON objects;
/// otherwise the patch replaces the value.
fn merge_fields(existing: &str, patch: &str) -> String {
    match (
        serde_json::from_str::<Value>(existing),
        serde_json::from_str::<Value>(patch),
    ) {
        (Ok(Value::Object(mut base)), Ok(Value::Object(fields))) => {
            base.extend(fields);
            Value::Object(base).to_string()
        }
        _ => patch.to_string(),
    }
}

// ============================================================================
// WebSocket server
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct Behavior {
    /// Record requests but never answer.
    silent: bool,
    /// Precede every answer with a response for an unknown id.
    inject_unknown: bool,
    /// Precede every answer with an undecodable text frame and a non-UTF-8
    /// binary frame.
    inject_garbage: bool,
    /// Buffer this many answers, then flush them in reverse order.
    hold: usize,
}

struct WsState {
    store: Mutex<HashMap<String, String>>,
    behavior: Mutex<Behavior>,
    requests: Mutex<Vec<Request>>,
    connections: AtomicUsize,
    drop_tx: broadcast::Sender<()>,
    notify_tx: broadcast::Sender<Notification>,
}

impl WsState {
    /// Applies a request to the store. Insert and update acknowledge with
    /// the key as value.
    fn apply(&self, request: &Request) -> Response {
        let id = request.message_id;
        let key = request.key.as_str();
        let mut store = self.store.lock();

        match request.op {
            Operation::Get => match store.get(key) {
                Some(value) => Response::ok(id).with_value(value.clone()),
                None => Response::error(id, NOT_FOUND),
            },
            Operation::Insert => {
                store.insert(key.to_string(), request.value.clone().unwrap_or_default());
                Response::ok(id).with_value(key)
            }
            Operation::Update => match store.get_mut(key) {
                Some(existing) => {
                    let patch = request.value.as_deref().unwrap_or_default();
                    *existing = merge_fields(existing, patch);
                    Response::ok(id).with_value(key)
                }
                None => Response::error(id, NOT_FOUND),
            },
            Operation::Delete => match store.remove(key) {
                Some(_) => Response::ok(id),
                None => Response::error(id, NOT_FOUND),
            },
        }
    }
}

type ServerSink = SplitSink<WebSocketStream<TcpStream>, Message>;

async fn send_text(sink: &mut ServerSink, text: String) -> bool {
    sink.send(Message::Text(text.into())).await.is_ok()
}

async fn serve_ws(stream: TcpStream, state: Arc<WsState>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let mut drop_rx = state.drop_tx.subscribe();
    let mut notify_rx = state.notify_tx.subscribe();
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut source) = ws.split();
    let mut held: Vec<Response> = Vec::new();

    'conn: loop {
        tokio::select! {
            msg = source.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break 'conn,
                    Some(Ok(_)) => continue 'conn,
                };
                let Ok(request) = Decoder::decode_request(text.as_str()) else {
                    continue 'conn;
                };
                state.requests.lock().push(request.clone());

                let behavior = *state.behavior.lock();
                if behavior.silent {
                    continue 'conn;
                }
                if behavior.inject_unknown {
                    let stray = Response::ok(u64::MAX).with_value("stray");
                    let Ok(text) = Encoder::encode_response(&stray) else { break 'conn };
                    if !send_text(&mut sink, text).await {
                        break 'conn;
                    }
                }

                if behavior.inject_garbage {
                    let garbage = [
                        Message::Text("{not json".into()),
                        Message::Binary(vec![0xff, 0xfe, 0xfd].into()),
                    ];
                    for frame in garbage {
                        if sink.send(frame).await.is_err() {
                            break 'conn;
                        }
                    }
                }

                held.push(state.apply(&request));
                if held.len() >= behavior.hold.max(1) {
                    for response in held.drain(..).rev() {
                        let Ok(text) = Encoder::encode_response(&response) else { break 'conn };
                        if !send_text(&mut sink, text).await {
                            break 'conn;
                        }
                    }
                }
            }
            // Abrupt drop: no close frame
            _ = drop_rx.recv() => break 'conn,
            Ok(notification) = notify_rx.recv() => {
                let Ok(text) = Encoder::encode_notification(&notification) else { continue 'conn };
                if !send_text(&mut sink, text).await {
                    break 'conn;
                }
            }
        }
    }
}

/// Mock HPKV WebSocket server.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<WsState>,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");

        let (drop_tx, _) = broadcast::channel(4);
        let (notify_tx, _) = broadcast::channel(64);
        let state = Arc::new(WsState {
            store: Mutex::new(HashMap::new()),
            behavior: Mutex::new(Behavior::default()),
            requests: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            drop_tx,
            notify_tx,
        });

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_ws(stream, accept_state.clone()));
            }
        });

        Self {
            addr,
            state,
            accept,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig::new(self.base_url(), MOCK_API_KEY)
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.behavior.lock().silent = silent;
    }

    pub fn set_inject_unknown(&self, inject: bool) {
        self.state.behavior.lock().inject_unknown = inject;
    }

    pub fn set_inject_garbage(&self, inject: bool) {
        self.state.behavior.lock().inject_garbage = inject;
    }

    /// Answers in batches of `batch`, newest first.
    pub fn set_hold(&self, batch: usize) {
        self.state.behavior.lock().hold = batch;
    }

    /// Closes every open connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.state.drop_tx.send(());
    }

    /// Pushes a notification to every open connection.
    pub fn notify(&self, notification: Notification) {
        let _ = self.state.notify_tx.send(notification);
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.state.requests.lock().clone()
    }

    pub fn stored(&self, key: &str) -> Option<String> {
        self.state.store.lock().get(key).cloned()
    }

    pub async fn wait_for_requests(&self, count: usize) {
        wait_until("requests", || self.state.requests.lock().len() >= count).await
    }

    pub async fn wait_for_connections(&self, count: usize) {
        wait_until("connections", || self.connection_count() >= count).await
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
        let _ = self.state.drop_tx.send(());
    }
}

// ============================================================================
// REST server
// ============================================================================

#[derive(Default)]
struct RestState {
    store: Mutex<BTreeMap<String, String>>,
    create_calls: AtomicUsize,
    increment_calls: AtomicUsize,
    increment_always_missing: AtomicBool,
}

type HttpResponse = hyper::Response<Full<Bytes>>;

fn json_response(status: StatusCode, body: Value) -> HttpResponse {
    let mut response = hyper::Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn not_found() -> HttpResponse {
    json_response(StatusCode::NOT_FOUND, json!({"message": NOT_FOUND}))
}

fn bad_request(message: &str) -> HttpResponse {
    json_response(StatusCode::BAD_REQUEST, json!({"message": message}))
}

async fn handle_rest(req: hyper::Request<Incoming>, state: Arc<RestState>) -> HttpResponse {
    let authorized = req
        .headers()
        .get("x-api-key")
        .is_some_and(|v| v.as_bytes() == MOCK_API_KEY.as_bytes());
    if !authorized {
        return json_response(StatusCode::UNAUTHORIZED, json!({"message": "Unauthorized"}));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return bad_request("unreadable body"),
    };

    match (method, path.as_str()) {
        (Method::POST, "/record/atomic") => {
            state.increment_calls.fetch_add(1, Ordering::SeqCst);
            let Ok(params) = serde_json::from_slice::<AtomicIncrementParams>(&body) else {
                return bad_request("invalid body");
            };
            if state.increment_always_missing.load(Ordering::SeqCst) {
                return not_found();
            }
            let mut store = state.store.lock();
            let Some(current) = store.get(&params.key) else {
                return not_found();
            };
            let Ok(current) = current.trim().parse::<i64>() else {
                return json_response(
                    StatusCode::OK,
                    json!({"success": false, "message": "Record value is not numeric"}),
                );
            };
            let new_value = current + params.increment;
            store.insert(params.key.clone(), new_value.to_string());
            json_response(
                StatusCode::OK,
                json!({"success": true, "key": params.key, "newValue": new_value}),
            )
        }
        (Method::POST, "/record") => {
            let Ok(payload) = serde_json::from_slice::<RecordPayload>(&body) else {
                return bad_request("invalid body");
            };
            let mut store = state.store.lock();
            if payload.partial_update == Some(true) {
                let Some(existing) = store.get_mut(&payload.key) else {
                    return not_found();
                };
                *existing = merge_fields(existing, &payload.value);
            } else {
                state.create_calls.fetch_add(1, Ordering::SeqCst);
                store.insert(payload.key, payload.value);
            }
            json_response(
                StatusCode::OK,
                json!({"success": true, "message": "Record inserted/updated successfully"}),
            )
        }
        (Method::GET, "/records") => {
            let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect();
            let (Some(start), Some(end)) = (params.get("startKey"), params.get("endKey")) else {
                return bad_request("startKey and endKey are required");
            };
            let limit = params
                .get("limit")
                .and_then(|l| l.parse::<usize>().ok())
                .unwrap_or(100);

            if start > end {
                return bad_request("startKey must not exceed endKey");
            }

            let store = state.store.lock();
            let matching: Vec<RangeRecord> = store
                .range(start.clone()..=end.clone())
                .map(|(key, value)| RangeRecord {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect();
            let truncated = matching.len() > limit;
            let records: Vec<RangeRecord> = matching.into_iter().take(limit).collect();
            let result = RangeResult {
                count: Some(records.len() as u64),
                truncated: Some(truncated),
                records,
            };
            json_response(StatusCode::OK, json!(result))
        }
        (Method::POST, "/token/websocket") => {
            let Ok(params) = serde_json::from_slice::<TokenParams>(&body) else {
                return bad_request("invalid body");
            };
            json_response(
                StatusCode::OK,
                json!({"token": format!("token-{}", params.subscribe_keys.len())}),
            )
        }
        (method, path) => {
            let Some(key) = path.strip_prefix("/record/") else {
                return not_found();
            };
            match method {
                Method::GET => match state.store.lock().get(key) {
                    Some(value) => json_response(StatusCode::OK, json!({"key": key, "value": value})),
                    None => not_found(),
                },
                Method::DELETE => match state.store.lock().remove(key) {
                    Some(_) => json_response(
                        StatusCode::OK,
                        json!({"success": true, "message": "Record deleted successfully"}),
                    ),
                    None => not_found(),
                },
                _ => json_response(StatusCode::METHOD_NOT_ALLOWED, json!({"message": "method not allowed"})),
            }
        }
    }
}

/// Mock HPKV REST server.
pub struct MockRest {
    addr: SocketAddr,
    state: Arc<RestState>,
    accept: JoinHandle<()>,
}

impl MockRest {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock REST server");
        let addr = listener.local_addr().expect("mock REST address");
        let state = Arc::new(RestState::default());

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle_rest(req, state).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            state,
            accept,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn client(&self) -> RestClient {
        RestClient::new(&self.base_url(), MOCK_API_KEY).expect("mock REST client")
    }

    /// Number of full-record writes (`POST /record` without `partialUpdate`).
    pub fn create_calls(&self) -> usize {
        self.state.create_calls.load(Ordering::SeqCst)
    }

    pub fn increment_calls(&self) -> usize {
        self.state.increment_calls.load(Ordering::SeqCst)
    }

    /// Makes every increment answer 404, even after the key is created.
    pub fn set_increment_always_missing(&self, missing: bool) {
        self.state
            .increment_always_missing
            .store(missing, Ordering::SeqCst);
    }

    pub fn stored(&self, key: &str) -> Option<String> {
        self.state.store.lock().get(key).cloned()
    }
}

impl Drop for MockRest {
    fn drop(&mut self) {
        self.accept.abort();
    }
}
