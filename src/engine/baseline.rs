use tracing::{info, warn};

use crate::domain::PriceMap;

/// First observed prices; all valuation is relative to this snapshot.
#[derive(Debug, Clone, Default)]
pub struct BaselineStore {
    prices: Option<PriceMap>,
}

impl BaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture `prices` unless a baseline already exists. Returns true if captured.
    pub fn initialize(&mut self, prices: &PriceMap) -> bool {
        if self.prices.is_some() {
            return false;
        }
        info!("Baseline captured for {} symbols", prices.len());
        self.prices = Some(prices.clone());
        true
    }

    /// Restore a persisted baseline. Ignored when one is already set.
    pub fn restore(&mut self, prices: PriceMap) {
        if self.prices.is_some() {
            warn!("Baseline already set, ignoring restore");
            return;
        }
        self.prices = Some(prices);
    }

    pub fn reset(&mut self) {
        warn!("Baseline reset");
        self.prices = None;
    }

    pub fn get(&self) -> Option<&PriceMap> {
        self.prices.as_ref()
    }
}
