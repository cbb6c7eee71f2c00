//! Prometheus metrics for the ingestion service.
//!
//! This module provides:
//! - Metrics registry with per-symbol counters, a gauge, and a histogram
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Write duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Prometheus metrics for the ingestion service.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Trades received by symbol.
    pub trades_total: CounterVec,
    /// Price writes by symbol and result (`ok` or `failed`).
    pub writes_total: CounterVec,
    /// Price write duration by symbol.
    pub write_duration: HistogramVec,
    /// Feed reconnections by symbol.
    pub reconnects_total: CounterVec,
    /// Feeds with an open connection.
    pub feeds_active: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let trades_total = CounterVec::new(
            Opts::new("hpkv_ingest_trades_total", "Trades received by symbol"),
            &["symbol"],
        )?;
        registry.register(Box::new(trades_total.clone()))?;

        let writes_total = CounterVec::new(
            Opts::new(
                "hpkv_ingest_writes_total",
                "Price writes by symbol and result",
            ),
            &["symbol", "result"],
        )?;
        registry.register(Box::new(writes_total.clone()))?;

        let write_duration = HistogramVec::new(
            HistogramOpts::new(
                "hpkv_ingest_write_duration_seconds",
                "Price write duration in seconds by symbol",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["symbol"],
        )?;
        registry.register(Box::new(write_duration.clone()))?;

        let reconnects_total = CounterVec::new(
            Opts::new(
                "hpkv_ingest_reconnects_total",
                "Feed reconnections by symbol",
            ),
            &["symbol"],
        )?;
        registry.register(Box::new(reconnects_total.clone()))?;

        let feeds_active = Gauge::with_opts(Opts::new(
            "hpkv_ingest_feeds_active",
            "Number of feeds with an open connection",
        ))?;
        registry.register(Box::new(feeds_active.clone()))?;

        Ok(Self {
            registry,
            trades_total,
            writes_total,
            write_duration,
            reconnects_total,
            feeds_active,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    serve_metrics(listener, metrics, shutdown).await;
    Ok(())
}

/// Serves metrics on an already bound listener.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Metrics server listening on http://{}/metrics", addr);
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }
}

fn text_response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => text_response(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                body,
            ),
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    "metrics encoding failed",
                )
            }
        },
        "/health" | "/healthz" => text_response(StatusCode::OK, "text/plain", "OK"),
        "/" => text_response(
            StatusCode::OK,
            "text/html",
            r#"<!DOCTYPE html>
<html>
<head><title>HPKV Ingestion Metrics</title></head>
<body>
<h1>HPKV Ingestion Metrics</h1>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>"#,
        ),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.trades_total.with_label_values(&["AAPL"]).inc();
        metrics
            .writes_total
            .with_label_values(&["AAPL", "ok"])
            .inc();
        metrics
            .write_duration
            .with_label_values(&["AAPL"])
            .observe(0.02);
        metrics.reconnects_total.with_label_values(&["GOOGL"]).inc();
        metrics.feeds_active.set(2.0);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("hpkv_ingest_trades_total{symbol=\"AAPL\"} 1"));
        assert!(encoded.contains("hpkv_ingest_writes_total"));
        assert!(encoded.contains("hpkv_ingest_write_duration_seconds"));
        assert!(encoded.contains("hpkv_ingest_reconnects_total{symbol=\"GOOGL\"} 1"));
        assert!(encoded.contains("hpkv_ingest_feeds_active 2"));
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_metrics_server_routes() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.trades_total.with_label_values(&["AAPL"]).inc();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(serve_metrics(listener, metrics, shutdown_rx));

        let body = http_get(addr, "/metrics").await;
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("hpkv_ingest_trades_total"));

        assert!(http_get(addr, "/health").await.ends_with("OK"));
        assert!(http_get(addr, "/nope").await.starts_with("HTTP/1.1 404"));

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }
}
