//! hpkv-stocks - stock price ingestion into HPKV
//!
//! Subscribes to a market data feed for each configured symbol and stores the
//! latest trade price under `stock:{SYMBOL}`.

use hpkv_client::RestClient;
use hpkv_ingest::{run_metrics_server, Config, FeedSettings, IngestionService, Metrics};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if HPKV_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("HPKV_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!("Configuration error: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting stock ingestion");
    tracing::info!("  HPKV endpoint: {}", config.hpkv.base_url);
    tracing::info!("  Feed endpoint: {}", config.feed.url);
    tracing::info!("  Symbols: {}", config.feed.symbols.join(", "));
    tracing::info!("  Reconnect policy: {:?}", config.reconnect.policy);

    let store = RestClient::with_timeout(
        &config.hpkv.base_url,
        config.hpkv.api_key.clone(),
        config.hpkv.timeout(),
    )?;
    let settings = FeedSettings::from_config(&config)?;
    let mut service = IngestionService::new(settings, store);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Start metrics server if enabled
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        service = service.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let shutdown_rx = shutdown_tx.subscribe();
        tracing::info!("  Metrics: enabled on {}", addr);
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    service.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping feeds...");

    service.stop_all().await;
    let _ = shutdown_tx.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Ingestion stopped");
    Ok(())
}
