use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::config::MarketConfig;
use crate::domain::{Regime, REFERENCE_ASSETS};
use crate::engine::history::PriceHistory;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub regime: Regime,
    /// Weighted short/medium-term change in percent, averaged over the reference assets.
    pub change_percent: f64,
}

/// Classifies the market regime from crypto momentum and remembers recent calls
/// so that a regime change can be required to persist before it is acted upon.
#[derive(Debug, Clone)]
pub struct MarketConditionDetector {
    config: MarketConfig,
    regime_history: VecDeque<(DateTime<Utc>, Regime)>,
}

impl MarketConditionDetector {
    pub fn new(config: MarketConfig) -> Self {
        let capacity = config.regime_history_len.max(1);
        Self {
            config,
            regime_history: VecDeque::with_capacity(capacity),
        }
    }

    /// `0.7 · short + 0.3 · medium`, per asset, averaged over BTC and ETH.
    pub fn change_signal(&self, history: &PriceHistory, now: DateTime<Utc>) -> f64 {
        let total: f64 = REFERENCE_ASSETS
            .iter()
            .map(|symbol| {
                let short = history.change_over(symbol, self.config.short_term_window, now);
                let medium = history.change_over(symbol, self.config.medium_term_window, now);
                self.config.short_term_weight * short + self.config.medium_term_weight * medium
            })
            .sum();
        total / REFERENCE_ASSETS.len() as f64
    }

    pub fn regime_for(&self, change_percent: f64) -> Regime {
        if change_percent >= self.config.bull_threshold {
            Regime::Bull
        } else if change_percent <= self.config.bear_threshold {
            Regime::Bear
        } else {
            Regime::Neutral
        }
    }

    /// Classify the current regime and record it in the bounded regime history.
    pub fn classify(&mut self, history: &PriceHistory, now: DateTime<Utc>) -> Classification {
        let change_percent = self.change_signal(history, now);
        let regime = self.regime_for(change_percent);

        if self.regime_history.len() >= self.config.regime_history_len.max(1) {
            self.regime_history.pop_front();
        }
        self.regime_history.push_back((now, regime));

        Classification {
            regime,
            change_percent,
        }
    }

    /// True when every classification inside the stability window equals `target`.
    /// An empty window is never stable.
    pub fn is_stable(&self, target: Regime, now: DateTime<Utc>) -> bool {
        let cutoff = now - self.config.stability_window;
        let mut seen = false;
        for (at, regime) in self.regime_history.iter().rev() {
            if *at < cutoff {
                break;
            }
            if *regime != target {
                return false;
            }
            seen = true;
        }
        seen
    }

    pub fn recent(&self) -> impl Iterator<Item = &(DateTime<Utc>, Regime)> {
        self.regime_history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PriceMap;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn sample(btc: f64, eth: f64) -> PriceMap {
        let mut m = PriceMap::new();
        m.insert("BTC/USD".into(), btc);
        m.insert("ETH/USD".into(), eth);
        m
    }

    #[test]
    fn test_classification_thresholds() {
        let detector = MarketConditionDetector::new(MarketConfig::default());
        assert_eq!(detector.regime_for(5.0), Regime::Bull);
        assert_eq!(detector.regime_for(4.99), Regime::Neutral);
        assert_eq!(detector.regime_for(-5.0), Regime::Bear);
        assert_eq!(detector.regime_for(0.0), Regime::Neutral);
    }

    #[test]
    fn test_signal_weights_short_and_medium_windows() {
        let detector = MarketConditionDetector::new(MarketConfig::default());
        let mut h = PriceHistory::new();
        h.append(t0(), sample(100.0, 100.0));
        h.append(t0() + Duration::hours(20), sample(110.0, 110.0));
        h.append(t0() + Duration::hours(24), sample(121.0, 121.0));
        let now = t0() + Duration::hours(24);
        // short (4h): 110 -> 121 = 10%; medium (24h): 100 -> 121 = 21%
        let signal = detector.change_signal(&h, now);
        assert!((signal - (0.7 * 10.0 + 0.3 * 21.0)).abs() < 1e-9);
    }

    #[test]
    fn test_missing_reference_asset_counts_as_flat() {
        let detector = MarketConditionDetector::new(MarketConfig::default());
        let mut h = PriceHistory::new();
        let mut only_btc = PriceMap::new();
        only_btc.insert("BTC/USD".into(), 100.0);
        h.append(t0(), only_btc.clone());
        only_btc.insert("BTC/USD".into(), 110.0);
        h.append(t0() + Duration::hours(1), only_btc);
        let signal = detector.change_signal(&h, t0() + Duration::hours(1));
        assert!((signal - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_stability_requires_full_window_agreement() {
        let mut detector = MarketConditionDetector::new(MarketConfig::default());
        assert!(!detector.is_stable(Regime::Neutral, t0()));

        let mut h = PriceHistory::new();
        h.append(t0(), sample(100.0, 100.0));
        detector.classify(&h, t0());
        assert!(detector.is_stable(Regime::Neutral, t0()));
        assert!(!detector.is_stable(Regime::Bull, t0()));

        for hour in 1..=3 {
            let now = t0() + Duration::hours(hour);
            h.append(now, sample(106.0, 106.0));
            assert_eq!(detector.classify(&h, now).regime, Regime::Bull);
        }
        // window at 03:00 covers 01:00..03:00, all BULL
        assert!(detector.is_stable(Regime::Bull, t0() + Duration::hours(3)));
        assert!(!detector.is_stable(Regime::Bull, t0() + Duration::hours(2)));
    }

    #[test]
    fn test_regime_history_is_bounded() {
        let cfg = MarketConfig {
            regime_history_len: 3,
            ..Default::default()
        };
        let mut detector = MarketConditionDetector::new(cfg);
        let h = PriceHistory::new();
        for i in 0..10 {
            detector.classify(&h, t0() + Duration::minutes(i));
        }
        assert_eq!(detector.recent().count(), 3);
    }
}
