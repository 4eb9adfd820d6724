use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Base currency, always valued at exactly 1.0.
pub const USD: &str = "USD";

/// Crypto assets whose movement drives regime classification.
pub const REFERENCE_ASSETS: [&str; 2] = ["BTC/USD", "ETH/USD"];

/// symbol -> price. Ordered so that sums over it are reproducible.
pub type PriceMap = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Regime {
    Neutral,
    Bull,
    Bear,
}

impl Regime {
    pub const ALL: [Regime; 3] = [Regime::Neutral, Regime::Bull, Regime::Bear];
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Regime::Neutral => write!(f, "NEUTRAL"),
            Regime::Bull => write!(f, "BULL"),
            Regime::Bear => write!(f, "BEAR"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetPrice {
    pub symbol: String,
    pub price: f64,
    pub ema_price: f64,
    pub last_updated: DateTime<Utc>,
    pub decimal_places: u32,
}

impl AssetPrice {
    pub fn new(symbol: &str, price: f64, last_updated: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            ema_price: price,
            last_updated,
            decimal_places: 2,
        }
    }
}

/// Normalized oracle snapshot, grouped the way the feed reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub crypto: Vec<AssetPrice>,
    pub precious_metals: Vec<AssetPrice>,
    pub stablecoins: Vec<AssetPrice>,
    pub forex: Vec<AssetPrice>,
}

impl PriceSnapshot {
    pub fn assets(&self) -> impl Iterator<Item = &AssetPrice> {
        self.crypto
            .iter()
            .chain(self.precious_metals.iter())
            .chain(self.stablecoins.iter())
            .chain(self.forex.iter())
    }

    pub fn find(&self, symbol: &str) -> Option<&AssetPrice> {
        self.assets().find(|a| a.symbol == symbol)
    }

    /// Flatten into a price map with the implicit USD entry. Zero and
    /// non-finite prices are dropped: they mean "no data".
    pub fn price_map(&self) -> PriceMap {
        let mut map = PriceMap::new();
        map.insert(USD.to_string(), 1.0);
        for asset in self.assets() {
            if asset.price.is_finite() && asset.price > 0.0 {
                map.insert(asset.symbol.clone(), asset.price);
            }
        }
        map
    }

    pub fn is_empty(&self) -> bool {
        self.crypto.is_empty()
            && self.precious_metals.is_empty()
            && self.stablecoins.is_empty()
            && self.forex.is_empty()
    }
}

/// Per-asset allocation. Each preset and every interpolated vector sums to 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightVector(pub BTreeMap<String, f64>);

impl WeightVector {
    pub fn from_pairs(pairs: &[(&str, f64)]) -> Self {
        Self(pairs.iter().map(|(s, w)| (s.to_string(), *w)).collect())
    }

    pub fn get(&self, symbol: &str) -> f64 {
        self.0.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    /// Linear blend between `self` (p = 0) and `to` (p = 1), over the union of symbols.
    pub fn lerp(&self, to: &WeightVector, p: f64) -> WeightVector {
        let mut out = BTreeMap::new();
        for symbol in self.0.keys().chain(to.0.keys()) {
            let from_w = self.get(symbol);
            let to_w = to.get(symbol);
            out.insert(symbol.clone(), from_w + (to_w - from_w) * p);
        }
        WeightVector(out)
    }

    /// Half the L1 distance: the fraction of the basket that changes hands.
    pub fn turnover(&self, to: &WeightVector) -> f64 {
        let mut symbols: Vec<&String> = self.0.keys().chain(to.0.keys()).collect();
        symbols.sort();
        symbols.dedup();
        symbols
            .into_iter()
            .map(|s| (to.get(s) - self.get(s)).abs())
            .sum::<f64>()
            / 2.0
    }
}

/// One cycle's output, consumed by publishers and the on-chain updater.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub basket_value: f64,
    pub regime: Regime,
    pub target_regime: Regime,
    pub token_price: f64,
    pub change_percent: f64,
    pub weights: WeightVector,
    pub target_weights: WeightVector,
    pub rebalance_progress: f64,
    pub timestamp: DateTime<Utc>,
    pub next_rebalance_eligible_at: DateTime<Utc>,
    pub breaker_tripped: bool,
}

/// Latest 24h ticker from a streaming exchange feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// A price for one symbol as reported by one source, for cross-validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleQuote {
    pub source: String,
    pub symbol: String,
    pub price: f64,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub rebalance_count_24h: usize,
    pub notional_moved_24h: f64,
    pub oracle_failures: u32,
    pub fetch_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub tripped: bool,
    pub reason: String,
    pub code: String,
    pub tripped_at: Option<DateTime<Utc>>,
    /// Milliseconds until the automatic clear, 0 when clear.
    pub time_remaining: i64,
    pub can_manual_override: bool,
    pub override_active: bool,
    pub override_expires_at: Option<DateTime<Utc>>,
    pub metrics: BreakerMetrics,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakerEventKind {
    Tripped,
    Cleared,
    Override,
}

impl std::fmt::Display for BreakerEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerEventKind::Tripped => write!(f, "TRIPPED"),
            BreakerEventKind::Cleared => write!(f, "CLEARED"),
            BreakerEventKind::Override => write!(f, "OVERRIDE"),
        }
    }
}

/// State transition emitted by the breaker for alerting and audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub id: String,
    pub kind: BreakerEventKind,
    pub code: String,
    pub message: String,
    pub at: DateTime<Utc>,
    pub auto_clear_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SwapBlock {
    LocalPause,
    ContractInactive,
    ContractUnreachable,
    BreakerTripped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapStatus {
    pub allowed: bool,
    pub reason: Option<String>,
    pub blocked_by: Option<SwapBlock>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
}

/// Why an administrative action was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Caller is not on the governance allow-list.
    Unauthorized,
    /// The action does not apply to the current state.
    Conflict,
    /// A downstream call failed.
    Unavailable,
}

/// Result of an administrative action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip)]
    pub rejection: Option<Rejection>,
}

impl ActionOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            rejection: None,
        }
    }

    fn refused(rejection: Rejection, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            rejection: Some(rejection),
        }
    }

    pub fn unauthorized(authority: &str) -> Self {
        Self::refused(
            Rejection::Unauthorized,
            format!("{} is not a governance authority", authority),
        )
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::refused(Rejection::Conflict, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::refused(Rejection::Unavailable, message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub running: bool,
    pub last_successful_update: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}
