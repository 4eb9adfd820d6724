use chrono::Duration;
use eyre::{Result, WrapErr};

use crate::domain::{Regime, WeightVector};

/// Allowed distance of a preset's total weight from 1.0.
pub const WEIGHT_TOLERANCE: f64 = 0.001;

#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub service: ServiceConfig,
    pub relay: RelayConfig,
    pub hermes_url: String,
    pub binance_symbols: Vec<String>,
    pub db_path: String,
    pub api_port: u16,
}

/// Everything the synchronous engine needs. `Default` gives the production presets.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub valuation: ValuationConfig,
    pub weights: WeightPresets,
    pub market: MarketConfig,
    pub rebalance: RebalanceConfig,
    pub breaker: BreakerConfig,
    pub swap_guard: SwapGuardConfig,
}

impl EngineConfig {
    /// Fail fast on anything that would make valuation or interpolation unsound.
    pub fn validate(&self) -> Result<()> {
        self.weights.validate()?;
        eyre::ensure!(
            self.valuation.initial_basket_value > 0.0,
            "initial basket value must be positive"
        );
        eyre::ensure!(
            self.market.bull_threshold > self.market.bear_threshold,
            "bull threshold {} must exceed bear threshold {}",
            self.market.bull_threshold,
            self.market.bear_threshold
        );
        eyre::ensure!(
            self.rebalance.duration > Duration::zero(),
            "rebalance duration must be positive"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ValuationConfig {
    pub initial_basket_value: f64,
    pub initial_token_price: f64,
}

impl Default for ValuationConfig {
    fn default() -> Self {
        Self {
            initial_basket_value: 10_000.0,
            initial_token_price: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeightPresets {
    pub neutral: WeightVector,
    pub bull: WeightVector,
    pub bear: WeightVector,
}

impl Default for WeightPresets {
    fn default() -> Self {
        Self {
            neutral: WeightVector::from_pairs(&[
                ("USD", 0.30),
                ("GBP/USD", 0.075),
                ("EUR/USD", 0.075),
                ("XAU/USD", 0.32),
                ("XAG/USD", 0.05),
                ("BTC/USD", 0.105),
                ("ETH/USD", 0.075),
            ]),
            bull: WeightVector::from_pairs(&[
                ("USD", 0.25),
                ("GBP/USD", 0.075),
                ("EUR/USD", 0.075),
                ("XAU/USD", 0.25),
                ("XAG/USD", 0.05),
                ("BTC/USD", 0.20),
                ("ETH/USD", 0.10),
            ]),
            bear: WeightVector::from_pairs(&[
                ("USD", 0.40),
                ("GBP/USD", 0.125),
                ("EUR/USD", 0.125),
                ("XAU/USD", 0.25),
                ("XAG/USD", 0.05),
                ("BTC/USD", 0.035),
                ("ETH/USD", 0.015),
            ]),
        }
    }
}

impl WeightPresets {
    pub fn for_regime(&self, regime: Regime) -> &WeightVector {
        match regime {
            Regime::Neutral => &self.neutral,
            Regime::Bull => &self.bull,
            Regime::Bear => &self.bear,
        }
    }

    /// Every preset must sum to 1 within tolerance. Never renormalized: interpolation
    /// between two validated presets is only unit-sum because both endpoints are.
    pub fn validate(&self) -> Result<()> {
        for regime in Regime::ALL {
            let weights = self.for_regime(regime);
            let total = weights.total();
            eyre::ensure!(
                (total - 1.0).abs() <= WEIGHT_TOLERANCE,
                "{} weights sum to {:.4}, expected 1.0 ± {}",
                regime,
                total,
                WEIGHT_TOLERANCE
            );
            if let Some((symbol, w)) = weights.iter().find(|(_, w)| !(0.0..=1.0).contains(*w)) {
                eyre::bail!("{} weight for {} is {}, outside [0, 1]", regime, symbol, w);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub bull_threshold: f64,
    pub bear_threshold: f64,
    pub short_term_window: Duration,
    pub medium_term_window: Duration,
    pub short_term_weight: f64,
    pub medium_term_weight: f64,
    pub stability_window: Duration,
    pub regime_history_len: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            bull_threshold: 5.0,
            bear_threshold: -5.0,
            short_term_window: Duration::hours(4),
            medium_term_window: Duration::hours(24),
            short_term_weight: 0.7,
            medium_term_weight: 0.3,
            stability_window: Duration::hours(2),
            regime_history_len: 512,
        }
    }
}

impl MarketConfig {
    /// How long price history is kept: the longest lookback plus a day.
    pub fn retention(&self) -> Duration {
        self.medium_term_window.max(Duration::hours(24)) + Duration::days(1)
    }
}

#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    pub duration: Duration,
    pub min_interval: Duration,
    pub emergency_threshold: f64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            duration: Duration::hours(24),
            min_interval: Duration::hours(6),
            emergency_threshold: 15.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub extreme_volatility_threshold: f64,
    pub extreme_volatility_freeze: Duration,
    pub max_change_5min: f64,
    pub max_change_1hour: f64,
    pub max_change_24hour: f64,
    pub volume_spike_multiple: f64,
    pub min_volume_samples: usize,
    pub max_single_rebalance: f64,
    pub max_rebalances_per_hour: usize,
    pub max_rebalances_per_day: usize,
    pub max_notional_per_day: f64,
    pub oracle_validation: bool,
    pub max_oracle_deviation: f64,
    /// Capped per symbol at the number of sources quoting it.
    pub min_oracle_sources: usize,
    pub oracle_staleness: Duration,
    pub max_consecutive_failures: u32,
    pub auto_reset_delay: Duration,
    pub manual_override_timeout: Duration,
    pub emergency_pause_duration: Duration,
    pub max_freeze_duration: Duration,
    pub auto_clear_on_neutral: bool,
    pub neutral_clear_threshold: f64,
    pub governance_authorities: Vec<String>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            extreme_volatility_threshold: 25.0,
            extreme_volatility_freeze: Duration::minutes(60),
            max_change_5min: 3.0,
            max_change_1hour: 8.0,
            max_change_24hour: 25.0,
            volume_spike_multiple: 5.0,
            min_volume_samples: 10,
            max_single_rebalance: 100_000.0,
            max_rebalances_per_hour: 2,
            max_rebalances_per_day: 6,
            max_notional_per_day: 500_000.0,
            oracle_validation: false,
            max_oracle_deviation: 2.0,
            min_oracle_sources: 3,
            oracle_staleness: Duration::minutes(5),
            max_consecutive_failures: 5,
            auto_reset_delay: Duration::minutes(30),
            manual_override_timeout: Duration::hours(24),
            emergency_pause_duration: Duration::hours(6),
            max_freeze_duration: Duration::hours(4),
            auto_clear_on_neutral: true,
            neutral_clear_threshold: 2.0,
            governance_authorities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwapGuardConfig {
    pub volatility_threshold_bps: f64,
    pub pause_duration: Duration,
    pub max_pause_duration: Duration,
}

impl Default for SwapGuardConfig {
    fn default() -> Self {
        Self {
            volatility_threshold_bps: 2_500.0,
            pause_duration: Duration::minutes(30),
            max_pause_duration: Duration::hours(4),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub evaluation_interval_secs: u64,
    pub swap_guard_interval_secs: u64,
    pub health_interval_secs: u64,
    pub io_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: 30,
            swap_guard_interval_secs: 30,
            health_interval_secs: 60,
            io_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub url: String,
    pub api_key: String,
    pub secret: String,
    pub price_decimals: u32,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let relay = RelayConfig {
            url: std::env::var("RELAY_URL").wrap_err("RELAY_URL not set")?,
            api_key: std::env::var("RELAY_API_KEY").wrap_err("RELAY_API_KEY not set")?,
            secret: std::env::var("RELAY_SECRET").wrap_err("RELAY_SECRET not set")?,
            price_decimals: env_u64("PRICE_DECIMALS", 8) as u32,
        };
        let hermes_url = std::env::var("HERMES_URL")
            .unwrap_or_else(|_| "https://hermes.pyth.network".to_string());
        let binance_symbols = env_list("BINANCE_SYMBOLS", &["btcusdt", "ethusdt"]);
        let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "apm-engine.db".to_string());
        let api_port: u16 = std::env::var("API_PORT")
            .unwrap_or_else(|_| "3001".to_string())
            .parse()
            .unwrap_or(3001);

        let defaults = EngineConfig::default();
        let weights = WeightPresets {
            neutral: env_weights("WEIGHTS_NEUTRAL", defaults.weights.neutral)?,
            bull: env_weights("WEIGHTS_BULL", defaults.weights.bull)?,
            bear: env_weights("WEIGHTS_BEAR", defaults.weights.bear)?,
        };

        let m = defaults.market;
        let market = MarketConfig {
            bull_threshold: env_f64("BULL_THRESHOLD", m.bull_threshold),
            bear_threshold: env_f64("BEAR_THRESHOLD", m.bear_threshold),
            short_term_window: env_minutes("SHORT_TERM_WINDOW_MINUTES", m.short_term_window),
            medium_term_window: env_minutes("MEDIUM_TERM_WINDOW_MINUTES", m.medium_term_window),
            short_term_weight: m.short_term_weight,
            medium_term_weight: m.medium_term_weight,
            stability_window: env_minutes("STABILITY_WINDOW_MINUTES", m.stability_window),
            regime_history_len: env_u64("REGIME_HISTORY_LEN", m.regime_history_len as u64) as usize,
        };

        let r = defaults.rebalance;
        let rebalance = RebalanceConfig {
            duration: env_minutes("REBALANCE_DURATION_MINUTES", r.duration),
            min_interval: env_minutes("MIN_REBALANCE_INTERVAL_MINUTES", r.min_interval),
            emergency_threshold: env_f64("EMERGENCY_THRESHOLD", r.emergency_threshold),
        };

        let b = defaults.breaker;
        let breaker = BreakerConfig {
            extreme_volatility_threshold: env_f64(
                "EXTREME_VOLATILITY_THRESHOLD",
                b.extreme_volatility_threshold,
            ),
            extreme_volatility_freeze: env_minutes(
                "EXTREME_VOLATILITY_FREEZE_MINUTES",
                b.extreme_volatility_freeze,
            ),
            max_change_5min: env_f64("MAX_PRICE_CHANGE_5MIN", b.max_change_5min),
            max_change_1hour: env_f64("MAX_PRICE_CHANGE_1HOUR", b.max_change_1hour),
            max_change_24hour: env_f64("MAX_PRICE_CHANGE_24HOUR", b.max_change_24hour),
            volume_spike_multiple: env_f64("VOLUME_SPIKE_THRESHOLD", b.volume_spike_multiple),
            min_volume_samples: env_u64("MIN_VOLUME_SAMPLE_SIZE", b.min_volume_samples as u64)
                as usize,
            max_single_rebalance: env_f64("MAX_SINGLE_REBALANCE_SIZE", b.max_single_rebalance),
            max_rebalances_per_hour: env_u64(
                "MAX_REBALANCES_PER_HOUR",
                b.max_rebalances_per_hour as u64,
            ) as usize,
            max_rebalances_per_day: env_u64(
                "MAX_REBALANCES_PER_DAY",
                b.max_rebalances_per_day as u64,
            ) as usize,
            max_notional_per_day: env_f64("MAX_VALUE_MOVED_PER_DAY", b.max_notional_per_day),
            oracle_validation: env_bool("ORACLE_VALIDATION", b.oracle_validation),
            max_oracle_deviation: env_f64("MAX_ORACLE_DEVIATION", b.max_oracle_deviation),
            min_oracle_sources: env_u64("MIN_ORACLE_SOURCES", b.min_oracle_sources as u64)
                as usize,
            oracle_staleness: env_minutes("ORACLE_STALENESS_MINUTES", b.oracle_staleness),
            max_consecutive_failures: env_u64(
                "MAX_CONSECUTIVE_FAILURES",
                b.max_consecutive_failures as u64,
            ) as u32,
            auto_reset_delay: env_minutes("AUTO_RESET_DELAY_MINUTES", b.auto_reset_delay),
            manual_override_timeout: env_minutes(
                "MANUAL_OVERRIDE_TIMEOUT_MINUTES",
                b.manual_override_timeout,
            ),
            emergency_pause_duration: env_minutes(
                "EMERGENCY_PAUSE_DURATION_MINUTES",
                b.emergency_pause_duration,
            ),
            max_freeze_duration: env_minutes("MAX_FREEZE_DURATION_MINUTES", b.max_freeze_duration),
            auto_clear_on_neutral: env_bool("AUTO_CLEAR_ON_NEUTRAL", b.auto_clear_on_neutral),
            neutral_clear_threshold: env_f64("NEUTRAL_CLEAR_THRESHOLD", b.neutral_clear_threshold),
            governance_authorities: env_list("GOVERNANCE_AUTHORITIES", &[]),
        };

        let s = defaults.swap_guard;
        let swap_guard = SwapGuardConfig {
            volatility_threshold_bps: env_f64(
                "SWAP_VOLATILITY_THRESHOLD_BPS",
                s.volatility_threshold_bps,
            ),
            pause_duration: env_minutes("SWAP_PAUSE_DURATION_MINUTES", s.pause_duration),
            max_pause_duration: env_minutes("SWAP_MAX_PAUSE_MINUTES", s.max_pause_duration),
        };

        let sv = ServiceConfig::default();
        let service = ServiceConfig {
            evaluation_interval_secs: env_u64("EVALUATION_INTERVAL_SECS", sv.evaluation_interval_secs),
            swap_guard_interval_secs: env_u64("SWAP_GUARD_INTERVAL_SECS", sv.swap_guard_interval_secs),
            health_interval_secs: env_u64("HEALTH_INTERVAL_SECS", sv.health_interval_secs),
            io_timeout_secs: env_u64("IO_TIMEOUT_SECS", sv.io_timeout_secs),
        };

        let engine = EngineConfig {
            valuation: ValuationConfig {
                initial_basket_value: env_f64("INITIAL_BASKET_VALUE", 10_000.0),
                initial_token_price: env_f64("INITIAL_TOKEN_PRICE", 1.0),
            },
            weights,
            market,
            rebalance,
            breaker,
            swap_guard,
        };
        engine.validate().wrap_err("invalid engine configuration")?;

        Ok(Config {
            engine,
            service,
            relay,
            hermes_url,
            binance_symbols,
            db_path,
            api_port,
        })
    }
}

/// Parse `"USD=30,XAU/USD=32,..."` (percentages) into a weight vector.
pub fn parse_weights(raw: &str) -> Result<WeightVector> {
    let mut weights = WeightVector::default();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (symbol, pct) = entry
            .split_once('=')
            .ok_or_else(|| eyre::eyre!("malformed weight entry '{}'", entry))?;
        let pct: f64 = pct
            .trim()
            .parse()
            .wrap_err_with(|| format!("bad percentage for {}", symbol))?;
        weights.0.insert(symbol.trim().to_string(), pct / 100.0);
    }
    Ok(weights)
}

fn env_weights(key: &str, default: WeightVector) -> Result<WeightVector> {
    match std::env::var(key) {
        Ok(raw) => parse_weights(&raw).wrap_err_with(|| format!("{} is invalid", key)),
        Err(_) => Ok(default),
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_minutes(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .map(Duration::minutes)
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_presets_sum_to_one() {
        let presets = WeightPresets::default();
        presets.validate().unwrap();
        for regime in Regime::ALL {
            assert!((presets.for_regime(regime).total() - 1.0).abs() <= WEIGHT_TOLERANCE);
        }
    }

    #[test]
    fn test_unbalanced_preset_rejected() {
        let mut presets = WeightPresets::default();
        presets.bull.0.insert("USD".into(), 0.40);
        let err = presets.validate().unwrap_err();
        assert!(err.to_string().contains("BULL"));
    }

    #[test]
    fn test_parse_weights_percentages() {
        let w = parse_weights("USD=40, XAU/USD=35,BTC/USD=25").unwrap();
        assert!((w.get("USD") - 0.40).abs() < 1e-12);
        assert!((w.get("XAU/USD") - 0.35).abs() < 1e-12);
        assert!((w.total() - 1.0).abs() < 1e-12);
        assert!(parse_weights("USD:40").is_err());
    }

    #[test]
    fn test_engine_config_rejects_inverted_thresholds() {
        let mut cfg = EngineConfig::default();
        cfg.market.bull_threshold = -6.0;
        assert!(cfg.validate().is_err());
    }
}
