//! Local pause window for the external swap contract.
//!
//! The contract has no pause instruction. Pausing means withholding the
//! periodic price refresh so the contract's own staleness rule disables
//! trading; resuming means asking it to extend price validity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SwapGuardConfig;
use crate::domain::{PriceMap, SwapBlock, SwapStatus};

/// Last state read from the swap contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractState {
    pub apm_price: f64,
    pub usdc_price: f64,
    pub usdt_price: f64,
    pub active: bool,
    pub price_valid_until: Option<DateTime<Utc>>,
}

impl ContractState {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.active && self.price_valid_until.map_or(true, |until| now < until)
    }

    pub fn prices(&self) -> PriceMap {
        let mut prices = PriceMap::new();
        prices.insert("APM/USD".to_string(), self.apm_price);
        prices.insert("USDC/USD".to_string(), self.usdc_price);
        prices.insert("USDT/USD".to_string(), self.usdt_price);
        prices
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PauseWindow {
    pub code: String,
    pub reason: String,
    pub paused_at: DateTime<Utc>,
    pub resume_at: DateTime<Utc>,
    pub volatility: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResumeDecision {
    /// Not paused, or the window is still open.
    Hold,
    /// Window elapsed but the breaker is still tripped; pushed out by one pause duration.
    Extended(DateTime<Utc>),
    Resume(String),
    /// Maximum pause reached; resume regardless of breaker state.
    ForceResume(String),
}

#[derive(Debug, Clone)]
pub struct SwapPauseController {
    config: SwapGuardConfig,
    window: Option<PauseWindow>,
    last_prices: PriceMap,
}

impl SwapPauseController {
    pub fn new(config: SwapGuardConfig) -> Self {
        Self {
            config,
            window: None,
            last_prices: PriceMap::new(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.window.is_some()
    }

    pub fn window(&self) -> Option<&PauseWindow> {
        self.window.as_ref()
    }

    /// Whether the periodic "refresh external price" action may run.
    pub fn should_refresh(&self) -> bool {
        self.window.is_none()
    }

    /// Open a pause window. Returns false if one is already open.
    pub fn pause(
        &mut self,
        code: &str,
        reason: &str,
        volatility: Option<f64>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.window.is_some() {
            return false;
        }
        let resume_at = now + self.config.pause_duration;
        warn!(
            "🚨 PAUSING SWAPS [{}]: {} (auto-resume not before {})",
            code, reason, resume_at
        );
        self.window = Some(PauseWindow {
            code: code.to_string(),
            reason: reason.to_string(),
            paused_at: now,
            resume_at,
            volatility,
        });
        true
    }

    /// One poll of the contract. Pauses on a tripped breaker or on a single-sample
    /// move beyond the volatility threshold. Returns true if this call paused.
    pub fn observe(&mut self, state: &ContractState, breaker_tripped: bool, now: DateTime<Utc>) -> bool {
        if self.window.is_some() {
            return false;
        }
        if breaker_tripped {
            return self.pause(
                "EMERGENCY_CIRCUIT_BREAKER",
                "Emergency circuit breaker triggered",
                None,
                now,
            );
        }

        let current = state.prices();
        if self.last_prices.is_empty() {
            self.last_prices = current;
            return false;
        }

        for (symbol, price) in &current {
            let Some(previous) = self.last_prices.get(symbol).copied() else {
                continue;
            };
            if previous <= 0.0 {
                continue;
            }
            let change = ((price - previous) / previous * 100.0).abs();
            if change * 100.0 >= self.config.volatility_threshold_bps {
                let reason = format!(
                    "Extreme price volatility detected for {}: {:.2}% change",
                    symbol, change
                );
                // Keep the pre-move prices so the jump is not silently absorbed.
                return self.pause("PRICE_VOLATILITY", &reason, Some(change), now);
            }
        }
        self.last_prices = current;
        false
    }

    /// Decide what the auto-resume timer should do at `now`.
    pub fn auto_resume_decision(&mut self, breaker_tripped: bool, now: DateTime<Utc>) -> ResumeDecision {
        let Some(window) = self.window.as_mut() else {
            return ResumeDecision::Hold;
        };

        if now >= window.resume_at {
            if !breaker_tripped {
                return ResumeDecision::Resume(
                    "Automatic resume after pause duration elapsed".to_string(),
                );
            }
            if now - window.paused_at < self.config.max_pause_duration {
                window.resume_at = now + self.config.pause_duration;
                info!(
                    "Pause timer expired but breaker still tripped, extending to {}",
                    window.resume_at
                );
                return ResumeDecision::Extended(window.resume_at);
            }
        }

        if now - window.paused_at >= self.config.max_pause_duration {
            return ResumeDecision::ForceResume(
                "Safety maximum pause duration exceeded".to_string(),
            );
        }
        ResumeDecision::Hold
    }

    /// Close the window after the contract accepted the validity extension.
    pub fn complete_resume(&mut self, manual: bool, reason: &str) -> bool {
        if self.window.take().is_none() {
            return false;
        }
        // Re-baseline the volatility watch on the next poll.
        self.last_prices.clear();
        info!(
            "🔓 Swaps resumed{}: {}",
            if manual { " (manual)" } else { "" },
            reason
        );
        true
    }

    /// Each blocking reason is reported distinctly, local pause first.
    pub fn swaps_allowed(
        &self,
        contract: Option<&ContractState>,
        breaker_tripped: bool,
        now: DateTime<Utc>,
    ) -> SwapStatus {
        let (paused_at, resume_at) = match &self.window {
            Some(w) => (Some(w.paused_at), Some(w.resume_at)),
            None => (None, None),
        };
        let blocked = |by: SwapBlock, reason: String| SwapStatus {
            allowed: false,
            reason: Some(reason),
            blocked_by: Some(by),
            paused_at,
            resume_at,
        };

        if let Some(window) = &self.window {
            return blocked(SwapBlock::LocalPause, window.reason.clone());
        }
        let Some(state) = contract else {
            return blocked(
                SwapBlock::ContractUnreachable,
                "Unable to fetch swap contract state".to_string(),
            );
        };
        if !state.is_active(now) {
            return blocked(
                SwapBlock::ContractInactive,
                "Swap contract is inactive (prices expired)".to_string(),
            );
        }
        if breaker_tripped {
            return blocked(
                SwapBlock::BreakerTripped,
                "Emergency circuit breaker is active".to_string(),
            );
        }
        SwapStatus {
            allowed: true,
            reason: None,
            blocked_by: None,
            paused_at,
            resume_at,
        }
    }
}
