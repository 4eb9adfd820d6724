use chrono::{TimeZone, Utc};
use eyre::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::domain::TickerUpdate;
use crate::feeds::normalize_exchange_symbol;

const STREAM_URL: &str = "wss://stream.binance.com:9443/stream";

#[derive(Debug, Deserialize)]
struct BinanceKlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: BinanceKline,
}

#[derive(Debug, Deserialize)]
struct BinanceKline {
    /// Close time, ms since epoch
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "c")]
    close: String,
    /// Base asset volume traded inside this interval
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    closed: bool,
}

/// One-minute kline stream for the configured pairs. Second price source and
/// the per-interval volume input for spike detection. Only closed klines are
/// forwarded so every volume sample covers a full minute.
pub struct BinanceKlineFeed {
    tx: broadcast::Sender<TickerUpdate>,
    symbols: Vec<String>,
    shutdown: Arc<AtomicBool>,
}

impl BinanceKlineFeed {
    pub fn new(
        tx: broadcast::Sender<TickerUpdate>,
        symbols: Vec<String>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tx,
            symbols,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<()> {
        if self.symbols.is_empty() {
            info!("No Binance symbols configured, kline feed disabled");
            return Ok(());
        }
        let mut backoff_ms: u64 = 1000;

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.connect_and_listen().await {
                Ok(()) => {
                    info!("Binance WS disconnected cleanly");
                    backoff_ms = 1000;
                }
                Err(e) => {
                    error!("Binance WS error: {:?}", e);
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            warn!("Reconnecting Binance WS in {}ms", backoff_ms);
            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(30_000);
        }
        info!("Binance kline feed stopped");
        Ok(())
    }

    async fn connect_and_listen(&self) -> Result<()> {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@kline_1m", s.to_lowercase()))
            .collect();
        let url = format!("{}?streams={}", STREAM_URL, streams.join("/"));

        let (ws_stream, _) = connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();

        info!("Connected to Binance WS for {:?}", self.symbols);

        while let Some(msg) = read.next().await {
            if self.shutdown.load(Ordering::SeqCst) {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(update) = parse_kline(&text) {
                        let _ = self.tx.send(update);
                    }
                }
                Ok(Message::Ping(data)) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => {
                    info!("Binance WS closed by server");
                    break;
                }
                Err(e) => {
                    error!("Binance WS read error: {:?}", e);
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Accepts both the combined-stream envelope and a bare kline event. Klines
/// still open yield `None`.
fn parse_kline(text: &str) -> Option<TickerUpdate> {
    #[derive(Deserialize)]
    struct Combined {
        data: BinanceKlineEvent,
    }

    let event = if let Ok(combined) = serde_json::from_str::<Combined>(text) {
        combined.data
    } else if let Ok(e) = serde_json::from_str::<BinanceKlineEvent>(text) {
        e
    } else {
        debug!("Ignoring unrecognized Binance message");
        return None;
    };
    if !event.kline.closed {
        return None;
    }

    let symbol = normalize_exchange_symbol(&event.symbol)?;
    let price = event.kline.close.parse::<f64>().ok()?;
    let volume = event.kline.volume.parse::<f64>().ok()?;
    let timestamp = Utc.timestamp_millis_opt(event.kline.close_time).single()?;
    Some(TickerUpdate {
        symbol,
        price,
        volume,
        timestamp,
    })
}
