use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::domain::{OracleQuote, PriceSnapshot, TickerUpdate};

/// Source of normalized price snapshots.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<PriceSnapshot>;
}

/// A snapshot with neither crypto nor metals carries nothing to value the basket
/// with, and counts as a failed fetch. A snapshot merely missing a symbol is fine.
pub fn validate_snapshot(snapshot: &PriceSnapshot) -> Result<()> {
    eyre::ensure!(
        !(snapshot.crypto.is_empty() && snapshot.precious_metals.is_empty()),
        "price snapshot has no crypto or precious metal entries"
    );
    Ok(())
}

/// Every priced asset in a snapshot as a quote attributed to `source`.
pub fn snapshot_quotes(snapshot: &PriceSnapshot, source: &str) -> Vec<OracleQuote> {
    snapshot
        .assets()
        .filter(|a| a.price > 0.0)
        .map(|a| OracleQuote {
            source: source.to_string(),
            symbol: a.symbol.clone(),
            price: a.price,
            published_at: a.last_updated,
        })
        .collect()
}

/// `BTCUSDT` -> `BTC/USD`. USDT-quoted pairs are treated as USD.
pub fn normalize_exchange_symbol(raw: &str) -> Option<String> {
    let upper = raw.to_uppercase();
    let base = upper
        .strip_suffix("USDT")
        .or_else(|| upper.strip_suffix("USD"))?;
    if base.is_empty() {
        return None;
    }
    Some(format!("{}/USD", base))
}

/// Latest ticker per symbol, shared between the stream consumer and the service.
#[derive(Clone, Default)]
pub struct TickerBook {
    tickers: Arc<RwLock<HashMap<String, TickerUpdate>>>,
}

impl TickerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, update: TickerUpdate) {
        self.tickers.write().await.insert(update.symbol.clone(), update);
    }

    /// Volumes of tickers newer than `max_age`.
    pub async fn volumes(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> BTreeMap<String, f64> {
        self.tickers
            .read()
            .await
            .values()
            .filter(|t| now - t.timestamp <= max_age)
            .map(|t| (t.symbol.clone(), t.volume))
            .collect()
    }

    pub async fn quotes(&self, source: &str) -> Vec<OracleQuote> {
        self.tickers
            .read()
            .await
            .values()
            .map(|t| OracleQuote {
                source: source.to_string(),
                symbol: t.symbol.clone(),
                price: t.price,
                published_at: t.timestamp,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.tickers.read().await.len()
    }
}

/// Drains ticker updates from the exchange stream into a [`TickerBook`].
pub struct TickerAggregator {
    rx: broadcast::Receiver<TickerUpdate>,
    book: TickerBook,
}

impl TickerAggregator {
    pub fn new(rx: broadcast::Receiver<TickerUpdate>, book: TickerBook) -> Self {
        Self { rx, book }
    }

    pub async fn run(mut self) {
        info!("Ticker aggregator started");

        loop {
            match self.rx.recv().await {
                Ok(update) => self.book.insert(update).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Ticker aggregator lagged by {} updates", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Ticker channel closed, aggregator shutting down");
                    break;
                }
            }
        }
    }
}
