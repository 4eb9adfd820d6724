use serde::Serialize;

use crate::config::ValuationConfig;
use crate::domain::{PriceMap, WeightVector};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Valuation {
    pub basket_value: f64,
    pub token_price: f64,
    /// Symbols whose ratio fell back to 1.0 because a price was missing or zero.
    pub fallbacks: Vec<String>,
}

/// Current / baseline price ratio for one symbol, or `None` when either side is unusable.
fn price_ratio(symbol: &str, current: &PriceMap, baseline: &PriceMap) -> Option<f64> {
    let now = current.get(symbol).copied().filter(|p| p.is_finite() && *p > 0.0)?;
    let base = baseline.get(symbol).copied().filter(|p| p.is_finite() && *p > 0.0)?;
    Some(now / base)
}

/// `Σ weight[s] · V0 · (current[s] / baseline[s])`, with a ratio of 1 for bad data.
pub fn basket_value(
    weights: &WeightVector,
    current: &PriceMap,
    baseline: &PriceMap,
    initial_value: f64,
) -> (f64, Vec<String>) {
    let mut fallbacks = Vec::new();
    let value: f64 = weights
        .iter()
        .map(|(symbol, weight)| {
            let ratio = price_ratio(symbol, current, baseline).unwrap_or_else(|| {
                fallbacks.push(symbol.clone());
                1.0
            });
            weight * initial_value * ratio
        })
        .sum();
    (value, fallbacks)
}

/// `P0 · basket / V0`.
pub fn token_price(basket_value: f64, cfg: &ValuationConfig) -> f64 {
    cfg.initial_token_price * (basket_value / cfg.initial_basket_value)
}

pub fn value_basket(
    weights: &WeightVector,
    current: &PriceMap,
    baseline: &PriceMap,
    cfg: &ValuationConfig,
) -> Valuation {
    let (basket_value, fallbacks) =
        basket_value(weights, current, baseline, cfg.initial_basket_value);
    Valuation {
        basket_value,
        token_price: token_price(basket_value, cfg),
        fallbacks,
    }
}
