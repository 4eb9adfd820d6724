use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{RebalanceConfig, WeightPresets};
use crate::domain::{Regime, WeightVector};
use crate::engine::market::MarketConditionDetector;

/// A rebalance that was just started.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceStart {
    pub from: WeightVector,
    pub to: WeightVector,
    pub target_regime: Regime,
    pub emergency: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalanceProgress {
    pub weights: WeightVector,
    pub progress: f64,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebalanceState {
    pub current_weights: WeightVector,
    pub target_weights: WeightVector,
    pub current_regime: Regime,
    pub target_regime: Regime,
    pub rebalance_start_time: Option<DateTime<Utc>>,
    pub last_rebalance_time: Option<DateTime<Utc>>,
    pub is_rebalancing: bool,
}

/// STEADY ⇄ REBALANCING. Owns the current and target weight vectors and moves
/// linearly from one to the other over a fixed duration.
#[derive(Debug, Clone)]
pub struct RebalanceEngine {
    config: RebalanceConfig,
    presets: WeightPresets,
    state: RebalanceState,
}

impl RebalanceEngine {
    /// Starts STEADY on the NEUTRAL preset. Presets must already be validated.
    pub fn new(config: RebalanceConfig, presets: WeightPresets) -> Self {
        let neutral = presets.neutral.clone();
        Self {
            config,
            presets,
            state: RebalanceState {
                current_weights: neutral.clone(),
                target_weights: neutral,
                current_regime: Regime::Neutral,
                target_regime: Regime::Neutral,
                rebalance_start_time: None,
                last_rebalance_time: None,
                is_rebalancing: false,
            },
        }
    }

    pub fn state(&self) -> &RebalanceState {
        &self.state
    }

    pub fn target_regime(&self) -> Regime {
        self.state.target_regime
    }

    pub fn is_rebalancing(&self) -> bool {
        self.state.is_rebalancing
    }

    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.state.last_rebalance_time {
            Some(last) => now - last >= self.config.min_interval,
            None => true,
        }
    }

    pub fn next_eligible_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.state.last_rebalance_time {
            Some(last) => (last + self.config.min_interval).max(now),
            None => now,
        }
    }

    /// Begin moving toward `target`'s preset. Returns `None` when cooldown blocks a
    /// non-emergency start or when `target` is already the destination.
    pub fn initiate(
        &mut self,
        target: Regime,
        emergency: bool,
        now: DateTime<Utc>,
    ) -> Option<RebalanceStart> {
        if !emergency && !self.cooldown_elapsed(now) {
            debug!("Rebalance to {} blocked by cooldown", target);
            return None;
        }
        if self.state.target_regime == target {
            return None;
        }

        // Start from wherever an in-flight blend currently is so weights never jump.
        let from = self.progress(now).weights;
        let to = self.presets.for_regime(target).clone();

        if emergency {
            warn!(
                "EMERGENCY rebalance {} -> {} (cooldown bypassed)",
                self.state.target_regime, target
            );
        } else {
            info!("Rebalance {} -> {} started", self.state.target_regime, target);
        }

        self.state.current_weights = from.clone();
        self.state.target_weights = to.clone();
        self.state.target_regime = target;
        self.state.rebalance_start_time = Some(now);
        self.state.is_rebalancing = true;

        Some(RebalanceStart {
            from,
            to,
            target_regime: target,
            emergency,
        })
    }

    /// Emergency bypass on a large move, otherwise act only on a stable regime change.
    pub fn update(
        &mut self,
        regime: Regime,
        change_percent: f64,
        detector: &MarketConditionDetector,
        now: DateTime<Utc>,
    ) -> Option<RebalanceStart> {
        if change_percent.abs() >= self.config.emergency_threshold {
            return self.initiate(regime, true, now);
        }
        if regime != self.state.target_regime && detector.is_stable(regime, now) {
            return self.initiate(regime, false, now);
        }
        None
    }

    /// Interpolated weights at `now`, without committing anything.
    pub fn progress(&self, now: DateTime<Utc>) -> RebalanceProgress {
        let start = match (self.state.is_rebalancing, self.state.rebalance_start_time) {
            (true, Some(start)) => start,
            _ => {
                return RebalanceProgress {
                    weights: self.state.current_weights.clone(),
                    progress: 1.0,
                    complete: true,
                }
            }
        };

        let elapsed = (now - start).num_milliseconds() as f64;
        let total = self.config.duration.num_milliseconds() as f64;
        let p = (elapsed / total).clamp(0.0, 1.0);
        let weights = if p >= 1.0 {
            self.state.target_weights.clone()
        } else {
            self.state.current_weights.lerp(&self.state.target_weights, p)
        };

        RebalanceProgress {
            weights,
            progress: p,
            complete: p >= 1.0,
        }
    }

    /// Progress at `now`; on completion commits the target and starts the cooldown clock.
    pub fn advance(&mut self, now: DateTime<Utc>) -> RebalanceProgress {
        let progress = self.progress(now);
        if self.state.is_rebalancing && progress.complete {
            info!("Rebalance to {} complete", self.state.target_regime);
            self.state.current_weights = self.state.target_weights.clone();
            self.state.current_regime = self.state.target_regime;
            self.state.is_rebalancing = false;
            self.state.rebalance_start_time = None;
            self.state.last_rebalance_time = Some(now);
        }
        progress
    }
}
