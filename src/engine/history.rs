use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use tracing::warn;

use crate::domain::PriceMap;

#[derive(Debug, Clone)]
pub struct PriceHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub prices: PriceMap,
}

/// Time-ordered log of price snapshots used for windowed change calculations.
///
/// Lookback is a linear nearest-timestamp scan, O(n) in retained samples. At a
/// 30 s poll over a 48 h retention that is under 6k entries per lookup; a higher
/// sample rate should move this to a binary search over the sorted deque.
#[derive(Debug, Clone, Default)]
pub struct PriceHistory {
    entries: VecDeque<PriceHistoryEntry>,
}

impl PriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot. Samples older than the newest one are dropped to keep ordering.
    pub fn append(&mut self, timestamp: DateTime<Utc>, prices: PriceMap) -> bool {
        if let Some(last) = self.entries.back() {
            if timestamp < last.timestamp {
                warn!(
                    "Dropping out-of-order price sample at {} (latest is {})",
                    timestamp, last.timestamp
                );
                return false;
            }
        }
        self.entries.push_back(PriceHistoryEntry { timestamp, prices });
        true
    }

    /// Drop everything older than `now - retention`.
    pub fn prune(&mut self, now: DateTime<Utc>, retention: Duration) {
        let cutoff = now - retention;
        while self.entries.front().is_some_and(|e| e.timestamp < cutoff) {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&PriceHistoryEntry> {
        self.entries.back()
    }

    /// Sample whose timestamp is nearest to `target`. Ties go to the older sample.
    pub fn nearest(&self, target: DateTime<Utc>) -> Option<&PriceHistoryEntry> {
        let mut best: Option<(&PriceHistoryEntry, Duration)> = None;
        for entry in &self.entries {
            let distance = (entry.timestamp - target).abs();
            match best {
                Some((_, d)) if d <= distance => {}
                _ => best = Some((entry, distance)),
            }
        }
        best.map(|(e, _)| e)
    }

    /// Percent change of `symbol` from the sample nearest `now - window` to the latest
    /// sample. Zero when either end is missing or unusable.
    pub fn change_over(&self, symbol: &str, window: Duration, now: DateTime<Utc>) -> f64 {
        self.change_within(symbol, window, now, None).unwrap_or(0.0)
    }

    /// Like [`change_over`](Self::change_over), but `None` when there is no usable
    /// lookback sample, or when the nearest one is further than `max_gap` from the
    /// target time.
    pub fn change_within(
        &self,
        symbol: &str,
        window: Duration,
        now: DateTime<Utc>,
        max_gap: Option<Duration>,
    ) -> Option<f64> {
        let latest = self.latest()?.prices.get(symbol).copied()?;
        let target = now - window;
        let past = self.nearest(target)?;
        if let Some(gap) = max_gap {
            if (past.timestamp - target).abs() > gap {
                return None;
            }
        }
        let previous = past.prices.get(symbol).copied()?;
        if previous <= 0.0 || !previous.is_finite() || !latest.is_finite() {
            return None;
        }
        Some((latest - previous) / previous * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn prices(btc: f64) -> PriceMap {
        let mut m = PriceMap::new();
        m.insert("BTC/USD".into(), btc);
        m
    }

    #[test]
    fn test_change_over_uses_nearest_sample() {
        let mut h = PriceHistory::new();
        h.append(t0(), prices(100.0));
        h.append(t0() + Duration::minutes(50), prices(104.0));
        h.append(t0() + Duration::minutes(70), prices(110.0));
        // now - 1h = 00:10, nearest sample is 00:00
        let change = h.change_over("BTC/USD", Duration::hours(1), t0() + Duration::minutes(70));
        assert!((change - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_change_over_tolerates_missing_symbol_and_empty_history() {
        let h = PriceHistory::new();
        assert_eq!(h.change_over("BTC/USD", Duration::hours(1), t0()), 0.0);

        let mut h = PriceHistory::new();
        h.append(t0(), prices(100.0));
        assert_eq!(h.change_over("ETH/USD", Duration::hours(1), t0()), 0.0);
        assert_eq!(h.change_over("BTC/USD", Duration::hours(1), t0()), 0.0);
    }

    #[test]
    fn test_change_within_rejects_distant_sample() {
        let mut h = PriceHistory::new();
        h.append(t0(), prices(100.0));
        h.append(t0() + Duration::hours(1), prices(105.0));
        let now = t0() + Duration::hours(1);
        let five = Duration::minutes(5);
        assert!(h.change_within("BTC/USD", five, now, Some(five / 2)).is_none());
        let hour = Duration::hours(1);
        let change = h.change_within("BTC/USD", hour, now, Some(hour / 2)).unwrap();
        assert!((change - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_prune_and_ordering() {
        let mut h = PriceHistory::new();
        h.append(t0(), prices(1.0));
        h.append(t0() + Duration::hours(30), prices(2.0));
        assert!(!h.append(t0() + Duration::hours(10), prices(3.0)));
        h.prune(t0() + Duration::hours(30), Duration::hours(24));
        assert_eq!(h.len(), 1);
        assert_eq!(h.latest().unwrap().prices["BTC/USD"], 2.0);
    }
}
