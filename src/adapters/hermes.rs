use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use eyre::{Result, WrapErr};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::{AssetPrice, PriceSnapshot};
use crate::feeds::PriceFeed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Crypto,
    PreciousMetal,
    Stablecoin,
    Forex,
}

struct FeedSpec {
    symbol: &'static str,
    id: &'static str,
    category: Category,
    decimal_places: u32,
}

const FEEDS: &[FeedSpec] = &[
    FeedSpec {
        symbol: "BTC/USD",
        id: "e62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43",
        category: Category::Crypto,
        decimal_places: 2,
    },
    FeedSpec {
        symbol: "ETH/USD",
        id: "ff61491a931112ddf1bd8147cd1b641375f79f5825126d665480874634fd0ace",
        category: Category::Crypto,
        decimal_places: 2,
    },
    FeedSpec {
        symbol: "XAU/USD",
        id: "765d2ba906dbc32ca17cc11f5310a89e9ee1f6420508c63861f2f8ba4ee34bb2",
        category: Category::PreciousMetal,
        decimal_places: 2,
    },
    FeedSpec {
        symbol: "XAG/USD",
        id: "f2fb02c32b055c805e7238d628e5e9dadef274376114eb1f012337cabe93871e",
        category: Category::PreciousMetal,
        decimal_places: 2,
    },
    FeedSpec {
        symbol: "USDC/USD",
        id: "eaa020c61cc479712813461ce153894a96a6c00b21ed0cfc2798d1f9a9e9c94a",
        category: Category::Stablecoin,
        decimal_places: 4,
    },
    FeedSpec {
        symbol: "USDT/USD",
        id: "2b89b9dc8fdf9f34709a5b106b472f0f39bb6ca9ce04b0fd7f2e971688e2e53b",
        category: Category::Stablecoin,
        decimal_places: 4,
    },
    FeedSpec {
        symbol: "EUR/USD",
        id: "a995d00bb36a63cef7fd2c287dc105fc8f3d93779f062f09551b0af3e81ec30b",
        category: Category::Forex,
        decimal_places: 4,
    },
    FeedSpec {
        symbol: "GBP/USD",
        id: "84c2dde9633d93d1bcad84e7dc41c9d56578b7ec52fabedc1f335d673df0a7c1",
        category: Category::Forex,
        decimal_places: 4,
    },
];

#[derive(Debug, Deserialize)]
struct LatestResponse {
    parsed: Vec<ParsedUpdate>,
}

#[derive(Debug, Deserialize)]
struct ParsedUpdate {
    id: String,
    price: RawPrice,
    ema_price: RawPrice,
}

#[derive(Debug, Deserialize)]
struct RawPrice {
    price: String,
    expo: i32,
    publish_time: i64,
}

impl RawPrice {
    fn scaled(&self) -> Option<f64> {
        let raw: f64 = self.price.parse().ok()?;
        Some(raw * 10f64.powi(self.expo))
    }

    fn published_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.publish_time, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Pyth Hermes REST client.
#[derive(Clone)]
pub struct HermesFeed {
    client: Client,
    base_url: String,
}

impl HermesFeed {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(timeout)
            .build()
            .wrap_err("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn latest_url(&self) -> String {
        let ids: Vec<String> = FEEDS.iter().map(|f| format!("ids[]=0x{}", f.id)).collect();
        format!(
            "{}/v2/updates/price/latest?{}&parsed=true",
            self.base_url,
            ids.join("&")
        )
    }
}

/// Group parsed Hermes updates into a snapshot. Unknown ids and unparseable
/// prices are skipped.
fn build_snapshot(updates: Vec<ParsedUpdate>) -> PriceSnapshot {
    let mut snapshot = PriceSnapshot::default();
    for update in updates {
        let id = update.id.trim_start_matches("0x").to_lowercase();
        let Some(known) = FEEDS.iter().find(|f| f.id == id) else {
            debug!("Ignoring unknown Hermes feed {}", id);
            continue;
        };
        let Some(price) = update.price.scaled() else {
            warn!("Unparseable Hermes price for {}", known.symbol);
            continue;
        };
        let asset = AssetPrice {
            symbol: known.symbol.to_string(),
            price,
            ema_price: update.ema_price.scaled().unwrap_or(price),
            last_updated: update.price.published_at(),
            decimal_places: known.decimal_places,
        };
        match known.category {
            Category::Crypto => snapshot.crypto.push(asset),
            Category::PreciousMetal => snapshot.precious_metals.push(asset),
            Category::Stablecoin => snapshot.stablecoins.push(asset),
            Category::Forex => snapshot.forex.push(asset),
        }
    }
    snapshot
}

#[async_trait]
impl PriceFeed for HermesFeed {
    fn name(&self) -> &str {
        "pyth"
    }

    async fn fetch(&self) -> Result<PriceSnapshot> {
        let resp: LatestResponse = self
            .client
            .get(self.latest_url())
            .send()
            .await
            .wrap_err("hermes request failed")?
            .error_for_status()
            .wrap_err("hermes returned error status")?
            .json()
            .await
            .wrap_err("hermes parse failed")?;

        Ok(build_snapshot(resp.parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_snapshot_scales_and_groups() {
        let body = r#"{
            "binary": {"encoding": "hex", "data": []},
            "parsed": [
                {"id": "e62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43",
                 "price": {"price": "6425010000000", "conf": "100", "expo": -8, "publish_time": 1717000000},
                 "ema_price": {"price": "6400000000000", "conf": "100", "expo": -8, "publish_time": 1717000000}},
                {"id": "0xf2fb02c32b055c805e7238d628e5e9dadef274376114eb1f012337cabe93871e",
                 "price": {"price": "3051000", "conf": "10", "expo": -5, "publish_time": 1717000000},
                 "ema_price": {"price": "3050000", "conf": "10", "expo": -5, "publish_time": 1717000000}},
                {"id": "deadbeef",
                 "price": {"price": "1", "conf": "1", "expo": 0, "publish_time": 1717000000},
                 "ema_price": {"price": "1", "conf": "1", "expo": 0, "publish_time": 1717000000}}
            ]
        }"#;
        let resp: LatestResponse = serde_json::from_str(body).unwrap();
        let snapshot = build_snapshot(resp.parsed);

        assert_eq!(snapshot.crypto.len(), 1);
        assert!((snapshot.crypto[0].price - 64_250.1).abs() < 1e-6);
        assert!((snapshot.crypto[0].ema_price - 64_000.0).abs() < 1e-6);
        assert_eq!(snapshot.precious_metals[0].symbol, "XAG/USD");
        assert!((snapshot.precious_metals[0].price - 30.51).abs() < 1e-9);
        assert!(snapshot.forex.is_empty());
    }

    #[test]
    fn test_latest_url_lists_every_feed() {
        let feed = HermesFeed::new("https://hermes.example/", std::time::Duration::from_secs(5)).unwrap();
        let url = feed.latest_url();
        assert!(url.starts_with("https://hermes.example/v2/updates/price/latest?ids[]=0x"));
        assert_eq!(url.matches("ids[]=").count(), FEEDS.len());
        assert!(url.ends_with("&parsed=true"));
    }
}
