//! Stock ingestion service.
//!
//! Runs one [`FeedSubscription`] per symbol and writes every received price
//! to HPKV under `{key_prefix}{SYMBOL}`. Write failures are logged and
//! counted; the subscription keeps running.

use crate::error::IngestError;
use crate::feed::{FeedEvent, FeedSettings, FeedSubscription};
use crate::metrics::Metrics;
use dashmap::DashMap;
use hpkv_client::RestClient;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Event buffer per symbol.
const EVENT_BUFFER: usize = 256;

/// Destination of ingested prices.
pub trait PriceStore: Send + Sync + 'static {
    fn write_price(
        &self,
        key: &str,
        price: f64,
    ) -> impl Future<Output = Result<(), IngestError>> + Send;
}

impl PriceStore for RestClient {
    async fn write_price(&self, key: &str, price: f64) -> Result<(), IngestError> {
        if self.create(key, price.to_string()).await {
            Ok(())
        } else {
            Err(IngestError::WriteRejected(key.to_string()))
        }
    }
}

/// Tasks belonging to one running symbol.
struct FeedHandle {
    shutdown: watch::Sender<bool>,
    feed: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Supervises the per-symbol feed subscriptions.
pub struct IngestionService<S: PriceStore> {
    settings: FeedSettings,
    store: Arc<S>,
    metrics: Option<Arc<Metrics>>,
    feeds: DashMap<String, FeedHandle>,
}

impl<S: PriceStore> IngestionService<S> {
    pub fn new(settings: FeedSettings, store: S) -> Self {
        Self {
            settings,
            store: Arc::new(store),
            metrics: None,
            feeds: DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &FeedSettings {
        &self.settings
    }

    /// Starts a subscription for every configured symbol not yet running.
    pub fn start(&self) {
        for symbol in self.settings.symbols.clone() {
            if let Err(e) = self.start_symbol(&symbol) {
                tracing::debug!("{}", e);
            }
        }
        tracing::info!("Ingestion started for {} symbol(s)", self.feeds.len());
    }

    /// Starts a subscription for one symbol.
    pub fn start_symbol(&self, symbol: &str) -> Result<(), IngestError> {
        let entry = match self.feeds.entry(symbol.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(IngestError::AlreadyRunning(symbol.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let subscription = FeedSubscription::new(symbol, &self.settings);
        let feed = tokio::spawn(subscription.run(events_tx, shutdown_rx));

        let writer = tokio::spawn(write_prices(
            symbol.to_string(),
            self.settings.key_for(symbol),
            events_rx,
            self.store.clone(),
            self.metrics.clone(),
        ));

        entry.insert(FeedHandle {
            shutdown: shutdown_tx,
            feed,
            writer,
        });
        Ok(())
    }

    /// Stops one symbol. Returns false if it was not running.
    pub async fn stop(&self, symbol: &str) -> bool {
        let Some((_, handle)) = self.feeds.remove(symbol) else {
            return false;
        };

        tracing::info!("Stopping ingestion for {}", symbol);
        let _ = handle.shutdown.send(true);
        if let Err(e) = handle.feed.await {
            tracing::warn!("Feed task for {} ended abnormally: {}", symbol, e);
        }
        // The writer finishes once the feed drops its event sender
        if let Err(e) = handle.writer.await {
            tracing::warn!("Writer task for {} ended abnormally: {}", symbol, e);
        }
        true
    }

    /// Stops every running symbol.
    pub async fn stop_all(&self) {
        let symbols = self.running_symbols();
        for symbol in &symbols {
            self.stop(symbol).await;
        }
        tracing::info!("Stopped {} feed(s)", symbols.len());
    }

    pub fn is_running(&self, symbol: &str) -> bool {
        self.feeds.contains_key(symbol)
    }

    pub fn running_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.feeds.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }
}

/// Consumes one symbol's feed events, writing prices and updating metrics.
async fn write_prices<S: PriceStore>(
    symbol: String,
    key: String,
    mut events: mpsc::Receiver<FeedEvent>,
    store: Arc<S>,
    metrics: Option<Arc<Metrics>>,
) {
    let mut connected = false;

    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Connected => {
                connected = true;
                if let Some(m) = &metrics {
                    m.feeds_active.inc();
                }
            }
            FeedEvent::Disconnected { retry_in, .. } => {
                if let Some(m) = &metrics {
                    if connected {
                        m.feeds_active.dec();
                    }
                    if retry_in.is_some() {
                        m.reconnects_total.with_label_values(&[&symbol]).inc();
                    }
                }
                connected = false;
            }
            FeedEvent::Trade(trade) => {
                if let Some(m) = &metrics {
                    m.trades_total.with_label_values(&[&symbol]).inc();
                }

                let started = Instant::now();
                let result = store.write_price(&key, trade.price).await;
                let outcome = match &result {
                    Ok(()) => {
                        tracing::debug!("Updated HPKV with price for {}", symbol);
                        "ok"
                    }
                    Err(e) => {
                        tracing::warn!("Failed to write price for {}: {}", symbol, e);
                        "failed"
                    }
                };
                if let Some(m) = &metrics {
                    m.writes_total.with_label_values(&[&symbol, outcome]).inc();
                    m.write_duration
                        .with_label_values(&[&symbol])
                        .observe(started.elapsed().as_secs_f64());
                }
            }
        }
    }

    if connected {
        if let Some(m) = &metrics {
            m.feeds_active.dec();
        }
    }
}
