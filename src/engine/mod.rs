pub mod baseline;
pub mod breaker;
pub mod history;
pub mod market;
pub mod rebalance;
pub mod swap_guard;
pub mod valuation;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::domain::{
    ActionOutcome, BreakerEvent, BreakerStatus, EvaluationResult, OracleQuote, PriceMap,
    PriceSnapshot,
};
use baseline::BaselineStore;
use breaker::detectors::Observation;
use breaker::CircuitBreaker;
use history::PriceHistory;
use market::MarketConditionDetector;
use rebalance::{RebalanceEngine, RebalanceStart, RebalanceState};

/// Everything one evaluation cycle produced besides the result itself.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub result: EvaluationResult,
    /// Set on the cycle that captured a new baseline.
    pub baseline_captured: Option<PriceMap>,
    pub rebalance_started: Option<RebalanceStart>,
    pub events: Vec<BreakerEvent>,
}

/// The basket pricing and risk engine. Owns every piece of mutable state; the
/// service drives it through `&mut self`, one cycle at a time.
pub struct BasketEngine {
    config: EngineConfig,
    baseline: BaselineStore,
    history: PriceHistory,
    detector: MarketConditionDetector,
    rebalance: RebalanceEngine,
    breaker: CircuitBreaker,
    last_result: Option<EvaluationResult>,
}

impl BasketEngine {
    /// Validates the weight presets; an unbalanced preset is fatal.
    pub fn new(config: EngineConfig) -> eyre::Result<Self> {
        config.validate()?;
        Ok(Self {
            baseline: BaselineStore::new(),
            history: PriceHistory::new(),
            detector: MarketConditionDetector::new(config.market.clone()),
            rebalance: RebalanceEngine::new(config.rebalance.clone(), config.weights.clone()),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            last_result: None,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// One full cycle against a single snapshot:
    /// history, classify, breaker check, rebalance update, valuation.
    pub fn evaluate(
        &mut self,
        snapshot: &PriceSnapshot,
        volumes: &BTreeMap<String, f64>,
        oracle_quotes: &[OracleQuote],
        now: DateTime<Utc>,
    ) -> CycleReport {
        let prices = snapshot.price_map();
        let baseline_captured = self
            .baseline
            .initialize(&prices)
            .then(|| prices.clone());

        self.history.append(now, prices.clone());
        self.history.prune(now, self.config.market.retention());

        let classification = self.detector.classify(&self.history, now);

        let tripped = self.breaker.check(&Observation {
            now,
            change_percent: classification.change_percent,
            history: &self.history,
            volumes,
            oracle_quotes,
        });

        let mut rebalance_started = None;
        if tripped {
            warn!("Circuit breaker tripped, rebalance targets frozen");
        } else if let Some(start) = self.rebalance.update(
            classification.regime,
            classification.change_percent,
            &self.detector,
            now,
        ) {
            let basket = self
                .last_result
                .as_ref()
                .map_or(self.config.valuation.initial_basket_value, |r| r.basket_value);
            self.breaker
                .record_rebalance(basket * start.from.turnover(&start.to), now);
            rebalance_started = Some(start);
        }

        let progress = self.rebalance.advance(now);

        let valuation = match self.baseline.get() {
            Some(baseline) => {
                valuation::value_basket(&progress.weights, &prices, baseline, &self.config.valuation)
            }
            None => valuation::value_basket(&progress.weights, &prices, &prices, &self.config.valuation),
        };
        if !valuation.fallbacks.is_empty() {
            warn!(
                "Missing or zero prices, valued at baseline ratio: {}",
                valuation.fallbacks.join(", ")
            );
        }

        let result = EvaluationResult {
            basket_value: valuation.basket_value,
            regime: classification.regime,
            target_regime: self.rebalance.target_regime(),
            token_price: valuation.token_price,
            change_percent: classification.change_percent,
            weights: progress.weights,
            target_weights: self.rebalance.state().target_weights.clone(),
            rebalance_progress: progress.progress,
            timestamp: now,
            next_rebalance_eligible_at: self.rebalance.next_eligible_at(now),
            breaker_tripped: self.breaker.is_tripped(),
        };

        info!(
            "📊 {} | token ${:.4} | basket ${:.2} | change {:+.2}% | target {} ({:.0}%)",
            result.regime,
            result.token_price,
            result.basket_value,
            result.change_percent,
            result.target_regime,
            result.rebalance_progress * 100.0
        );

        self.last_result = Some(result.clone());
        CycleReport {
            result,
            baseline_captured,
            rebalance_started,
            events: self.breaker.drain_events(),
        }
    }

    pub fn last_result(&self) -> Option<&EvaluationResult> {
        self.last_result.as_ref()
    }

    pub fn rebalance_state(&self) -> &RebalanceState {
        self.rebalance.state()
    }

    pub fn baseline(&self) -> Option<&PriceMap> {
        self.baseline.get()
    }

    pub fn restore_baseline(&mut self, prices: PriceMap, captured_at: DateTime<Utc>) {
        info!("Restoring baseline captured at {}", captured_at);
        self.baseline.restore(prices);
    }

    /// The next cycle captures a fresh baseline.
    pub fn reset_baseline(&mut self) -> ActionOutcome {
        self.baseline.reset();
        ActionOutcome::ok("Baseline cleared, next evaluation captures a new one")
    }

    pub fn is_breaker_tripped(&self) -> bool {
        self.breaker.is_tripped()
    }

    pub fn breaker_status(&self, now: DateTime<Utc>) -> BreakerStatus {
        self.breaker.status(now)
    }

    pub fn manual_unfreeze(&mut self, authority: &str, now: DateTime<Utc>) -> ActionOutcome {
        self.breaker.manual_unfreeze(authority, now)
    }

    pub fn emergency_pause(&mut self, authority: &str, reason: &str, now: DateTime<Utc>) -> ActionOutcome {
        self.breaker.emergency_pause(authority, reason, now)
    }

    pub fn manual_override(&mut self, authority: &str, reason: &str, now: DateTime<Utc>) -> ActionOutcome {
        self.breaker.manual_override(authority, reason, now)
    }

    pub fn record_fetch_failure(&mut self, error: &str, now: DateTime<Utc>) -> bool {
        self.breaker.record_fetch_failure(error, now)
    }

    pub fn record_fetch_success(&mut self) {
        self.breaker.record_fetch_success();
    }

    /// Breaker transitions caused outside of `evaluate` (admin actions, fetch failures).
    pub fn drain_events(&mut self) -> Vec<BreakerEvent> {
        self.breaker.drain_events()
    }
}
