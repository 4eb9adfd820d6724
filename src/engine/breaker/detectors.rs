//! Independent anomaly detectors feeding the circuit breaker.
//!
//! Every detector sees every cycle so that rolling state (volume averages,
//! failure counters) stays current even while the breaker is already tripped.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

use crate::config::BreakerConfig;
use crate::domain::{OracleQuote, USD};
use crate::engine::history::PriceHistory;

/// Inputs for one breaker check.
pub struct Observation<'a> {
    pub now: DateTime<Utc>,
    pub change_percent: f64,
    pub history: &'a PriceHistory,
    /// Latest traded volume per symbol, if a volume source is connected.
    pub volumes: &'a BTreeMap<String, f64>,
    pub oracle_quotes: &'a [OracleQuote],
}

/// A detector's request to arm the breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    pub code: &'static str,
    pub reason: String,
    /// Recovery time; `None` means the breaker's standard auto-reset delay.
    pub duration: Option<Duration>,
}

impl Trip {
    fn new(code: &'static str, reason: String) -> Self {
        Self {
            code,
            reason,
            duration: None,
        }
    }
}

pub trait Detector: Send {
    fn name(&self) -> &'static str;

    fn observe(&mut self, obs: &Observation<'_>) -> Option<Trip>;

    /// Consecutive failed validations, for detectors that count them.
    fn failure_count(&self) -> u32 {
        0
    }

    /// Forget failure counters after the breaker clears.
    fn reset(&mut self) {}
}

/// Builds the detector set for a config, in evaluation order.
pub fn default_detectors(config: &BreakerConfig) -> Vec<Box<dyn Detector>> {
    let mut detectors: Vec<Box<dyn Detector>> = vec![
        Box::new(AggregateVolatility::new(config)),
        Box::new(PriceAnomaly::new(config)),
        Box::new(VolumeSpike::new(config)),
    ];
    if config.oracle_validation {
        detectors.push(Box::new(OracleValidator::new(config)));
    }
    detectors
}

// ---------------------------------------------------------------------------
// Aggregate volatility
// ---------------------------------------------------------------------------

pub struct AggregateVolatility {
    threshold: f64,
    freeze: Duration,
}

impl AggregateVolatility {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            threshold: config.extreme_volatility_threshold,
            freeze: config.extreme_volatility_freeze,
        }
    }
}

impl Detector for AggregateVolatility {
    fn name(&self) -> &'static str {
        "aggregate_volatility"
    }

    fn observe(&mut self, obs: &Observation<'_>) -> Option<Trip> {
        if obs.change_percent.abs() < self.threshold {
            return None;
        }
        Some(Trip {
            code: "EXTREME_VOLATILITY",
            reason: format!(
                "Extreme market volatility: {:.2}% (threshold {}%)",
                obs.change_percent, self.threshold
            ),
            duration: Some(self.freeze),
        })
    }
}

// ---------------------------------------------------------------------------
// Per-asset anomaly over 5m / 1h / 24h
// ---------------------------------------------------------------------------

pub struct PriceAnomaly {
    windows: Vec<(&'static str, Duration, f64)>,
}

impl PriceAnomaly {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            windows: vec![
                ("5m", Duration::minutes(5), config.max_change_5min),
                ("1h", Duration::hours(1), config.max_change_1hour),
                ("24h", Duration::hours(24), config.max_change_24hour),
            ],
        }
    }
}

impl Detector for PriceAnomaly {
    fn name(&self) -> &'static str {
        "price_anomaly"
    }

    fn observe(&mut self, obs: &Observation<'_>) -> Option<Trip> {
        let latest = obs.history.latest()?;
        for symbol in latest.prices.keys().filter(|s| s.as_str() != USD) {
            for (label, window, limit) in &self.windows {
                // A lookback sample more than half a window away from its target
                // says nothing about this window; skip rather than misattribute.
                let Some(change) =
                    obs.history
                        .change_within(symbol, *window, obs.now, Some(*window / 2))
                else {
                    continue;
                };
                if change.abs() > *limit {
                    return Some(Trip::new(
                        "PRICE_ANOMALY",
                        format!(
                            "{} moved {:.2}% in {} (limit {}%)",
                            symbol, change, label, limit
                        ),
                    ));
                }
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Volume spike
// ---------------------------------------------------------------------------

pub struct VolumeSpike {
    multiple: f64,
    min_samples: usize,
    retention: Duration,
    samples: HashMap<String, VecDeque<(DateTime<Utc>, f64)>>,
}

impl VolumeSpike {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            multiple: config.volume_spike_multiple,
            min_samples: config.min_volume_samples.max(1),
            retention: Duration::hours(24),
            samples: HashMap::new(),
        }
    }

    fn average(samples: &VecDeque<(DateTime<Utc>, f64)>) -> f64 {
        samples.iter().map(|(_, v)| v).sum::<f64>() / samples.len() as f64
    }
}

impl Detector for VolumeSpike {
    fn name(&self) -> &'static str {
        "volume_spike"
    }

    fn observe(&mut self, obs: &Observation<'_>) -> Option<Trip> {
        let cutoff = obs.now - self.retention;
        let mut trip = None;

        for (symbol, volume) in obs.volumes {
            if !volume.is_finite() || *volume < 0.0 {
                continue;
            }
            let samples = self.samples.entry(symbol.clone()).or_default();
            while samples.front().is_some_and(|(at, _)| *at < cutoff) {
                samples.pop_front();
            }

            // Average over prior samples only, so the spike itself does not dilute it.
            if trip.is_none() && samples.len() >= self.min_samples {
                let average = Self::average(samples);
                if average > 0.0 && volume / average > self.multiple {
                    trip = Some(Trip::new(
                        "VOLUME_SPIKE",
                        format!(
                            "{} volume {:.1}x the rolling average (limit {}x)",
                            symbol,
                            volume / average,
                            self.multiple
                        ),
                    ));
                }
            }
            samples.push_back((obs.now, *volume));
        }
        trip
    }
}

// ---------------------------------------------------------------------------
// Oracle cross-validation
// ---------------------------------------------------------------------------

pub struct OracleValidator {
    max_deviation: f64,
    min_sources: usize,
    staleness: Duration,
    max_failures: u32,
    consecutive_failures: u32,
}

impl OracleValidator {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            max_deviation: config.max_oracle_deviation,
            min_sources: config.min_oracle_sources,
            staleness: config.oracle_staleness,
            max_failures: config.max_consecutive_failures,
            consecutive_failures: 0,
        }
    }
}

impl Detector for OracleValidator {
    fn name(&self) -> &'static str {
        "oracle_validation"
    }

    fn observe(&mut self, obs: &Observation<'_>) -> Option<Trip> {
        if obs.oracle_quotes.is_empty() {
            return None;
        }

        // Per symbol: every source quoting it, and the fresh prices among them.
        let mut by_symbol: BTreeMap<&str, (BTreeSet<&str>, Vec<f64>)> = BTreeMap::new();
        for quote in obs.oracle_quotes {
            let (sources, prices) = by_symbol.entry(quote.symbol.as_str()).or_default();
            sources.insert(quote.source.as_str());
            let fresh = obs.now - quote.published_at < self.staleness;
            if fresh && quote.price.is_finite() && quote.price > 0.0 {
                prices.push(quote.price);
            }
        }

        let mut insufficient = false;
        for (symbol, (sources, prices)) in &by_symbol {
            // A symbol quoted by a single source has nothing to cross-check against.
            if sources.len() < 2 {
                continue;
            }
            let required = self.min_sources.min(sources.len());
            if prices.len() < required {
                debug!(
                    "{}: {} fresh oracle sources, need {}",
                    symbol,
                    prices.len(),
                    required
                );
                insufficient = true;
                continue;
            }
            let avg = prices.iter().sum::<f64>() / prices.len() as f64;
            for price in prices {
                let deviation = ((price - avg) / avg * 100.0).abs();
                if deviation > self.max_deviation {
                    return Some(Trip::new(
                        "ORACLE_DEVIATION",
                        format!(
                            "Oracle price deviation on {}: {:.2}% (limit {}%)",
                            symbol, deviation, self.max_deviation
                        ),
                    ));
                }
            }
        }

        if !insufficient {
            self.consecutive_failures = 0;
            return None;
        }

        // At most one increment per cycle, however many symbols fell short.
        self.consecutive_failures += 1;
        warn!(
            "Oracle validation failed ({}/{} consecutive)",
            self.consecutive_failures, self.max_failures
        );
        if self.consecutive_failures >= self.max_failures {
            return Some(Trip::new(
                "ORACLE_FAILURE_THRESHOLD",
                format!(
                    "Oracle failure threshold exceeded: {} failures",
                    self.consecutive_failures
                ),
            ));
        }
        None
    }

    fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }

    fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

// ---------------------------------------------------------------------------
// Rebalance abuse limits
// ---------------------------------------------------------------------------

/// 24h ledger of rebalance notionals, checked whenever a rebalance starts.
#[derive(Debug, Clone)]
pub struct RebalanceLimits {
    max_single: f64,
    max_per_hour: usize,
    max_per_day: usize,
    max_notional_per_day: f64,
    ledger: VecDeque<(DateTime<Utc>, f64)>,
}

impl RebalanceLimits {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            max_single: config.max_single_rebalance,
            max_per_hour: config.max_rebalances_per_hour,
            max_per_day: config.max_rebalances_per_day,
            max_notional_per_day: config.max_notional_per_day,
            ledger: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(24);
        while self.ledger.front().is_some_and(|(at, _)| *at <= cutoff) {
            self.ledger.pop_front();
        }
    }

    /// Record a rebalance and report the first limit it breaks, if any.
    pub fn record(&mut self, notional: f64, now: DateTime<Utc>) -> Option<Trip> {
        self.prune(now);
        self.ledger.push_back((now, notional));

        if notional > self.max_single {
            return Some(Trip::new(
                "REBALANCE_SIZE_LIMIT",
                format!(
                    "Rebalance of {:.2} exceeds single-move limit {:.2}",
                    notional, self.max_single
                ),
            ));
        }

        let hour_ago = now - Duration::hours(1);
        let last_hour = self.ledger.iter().filter(|(at, _)| *at > hour_ago).count();
        if last_hour > self.max_per_hour {
            return Some(Trip::new(
                "REBALANCE_FREQUENCY_HOURLY",
                format!(
                    "{} rebalances in the last hour (limit {})",
                    last_hour, self.max_per_hour
                ),
            ));
        }

        if self.ledger.len() > self.max_per_day {
            return Some(Trip::new(
                "REBALANCE_FREQUENCY_DAILY",
                format!(
                    "{} rebalances in the last 24h (limit {})",
                    self.ledger.len(),
                    self.max_per_day
                ),
            ));
        }

        let moved = self.notional_24h();
        if moved > self.max_notional_per_day {
            return Some(Trip::new(
                "REBALANCE_VALUE_LIMIT",
                format!(
                    "{:.2} moved in the last 24h (limit {:.2})",
                    moved, self.max_notional_per_day
                ),
            ));
        }
        None
    }

    pub fn count_24h(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::hours(24);
        self.ledger.iter().filter(|(at, _)| *at > cutoff).count()
    }

    fn notional_24h(&self) -> f64 {
        self.ledger.iter().map(|(_, n)| n).sum()
    }

    pub fn notional_moved_24h(&self, now: DateTime<Utc>) -> f64 {
        let cutoff = now - Duration::hours(24);
        self.ledger
            .iter()
            .filter(|(at, _)| *at > cutoff)
            .map(|(_, n)| n)
            .sum()
    }
}
