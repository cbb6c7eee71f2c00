//! Mock market data feed for tests.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
struct FeedState {
    received: Mutex<Vec<Value>>,
    tokens: Mutex<Vec<String>>,
    connections: AtomicUsize,
}

pub struct MockFeed {
    addr: SocketAddr,
    state: Arc<FeedState>,
    outbound: broadcast::Sender<String>,
    drop_tx: broadcast::Sender<()>,
    accept: JoinHandle<()>,
}

impl MockFeed {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(FeedState::default());
        let (outbound, _) = broadcast::channel(64);
        let (drop_tx, _) = broadcast::channel(4);

        let accept = {
            let state = state.clone();
            let outbound = outbound.clone();
            let drop_tx = drop_tx.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(
                        stream,
                        state.clone(),
                        outbound.subscribe(),
                        drop_tx.subscribe(),
                    ));
                }
            })
        };

        Self {
            addr,
            state,
            outbound,
            drop_tx,
            accept,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn send_trade(&self, symbol: &str, price: f64) {
        let message = json!({
            "type": "trade",
            "data": [{"s": symbol, "p": price, "v": 1, "t": 1_700_000_000_000i64}],
        });
        let _ = self.outbound.send(message.to_string());
    }

    pub fn drop_connections(&self) {
        let _ = self.drop_tx.send(());
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    pub fn last_token(&self) -> Option<String> {
        self.state.tokens.lock().last().cloned()
    }

    pub async fn wait_for_messages(&self, count: usize) {
        self.wait_until(|| self.state.received.lock().len() >= count)
            .await
    }

    pub async fn wait_for_subscriptions(&self, count: usize) {
        self.wait_until(|| {
            self.state
                .received
                .lock()
                .iter()
                .filter(|m| m["type"] == "subscribe")
                .count()
                >= count
        })
        .await
    }

    async fn wait_until(&self, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "mock feed wait timed out");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for MockFeed {
    fn drop(&mut self) {
        self.accept.abort();
        let _ = self.drop_tx.send(());
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<FeedState>,
    mut outbound: broadcast::Receiver<String>,
    mut drop_rx: broadcast::Receiver<()>,
) {
    let tokens = state.clone();
    let capture = move |req: &Request, resp: Response| {
        let token = req.uri().query().and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "token")
                .map(|(_, v)| v.into_owned())
        });
        if let Some(token) = token {
            tokens.tokens.lock().push(token);
        }
        Ok::<_, ErrorResponse>(resp)
    };
    let Ok(ws) = accept_hdr_async(stream, capture).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                        state.received.lock().push(value);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            Ok(text) = outbound.recv() => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = drop_rx.recv() => break,
        }
    }
}
