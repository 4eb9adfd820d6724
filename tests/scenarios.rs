use apm_engine::config::{EngineConfig, RebalanceConfig, WeightPresets};
use apm_engine::domain::{AssetPrice, BreakerEventKind, PriceSnapshot, Regime};
use apm_engine::engine::market::MarketConditionDetector;
use apm_engine::engine::rebalance::RebalanceEngine;
use apm_engine::engine::{BasketEngine, CycleReport};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;

const GOV: &str = "gov-multisig";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap()
}

fn engine() -> BasketEngine {
    let mut cfg = EngineConfig::default();
    cfg.breaker.governance_authorities = vec![GOV.to_string()];
    BasketEngine::new(cfg).unwrap()
}

fn snapshot(btc: f64, eth: f64, now: DateTime<Utc>) -> PriceSnapshot {
    PriceSnapshot {
        crypto: vec![
            AssetPrice::new("BTC/USD", btc, now),
            AssetPrice::new("ETH/USD", eth, now),
        ],
        precious_metals: vec![
            AssetPrice::new("XAU/USD", 2_400.0, now),
            AssetPrice::new("XAG/USD", 28.0, now),
        ],
        stablecoins: vec![
            AssetPrice::new("USDC/USD", 1.0, now),
            AssetPrice::new("USDT/USD", 1.0, now),
        ],
        forex: vec![
            AssetPrice::new("EUR/USD", 1.09, now),
            AssetPrice::new("GBP/USD", 1.28, now),
        ],
    }
}

fn eval(engine: &mut BasketEngine, btc: f64, eth: f64, now: DateTime<Utc>) -> CycleReport {
    engine.evaluate(&snapshot(btc, eth, now), &BTreeMap::new(), &[], now)
}

#[test]
fn sustained_rally_rebalances_toward_bull() {
    let mut engine = engine();
    let base = eval(&mut engine, 50_000.0, 3_000.0, t0());
    assert_eq!(base.result.regime, Regime::Neutral);
    assert!((base.result.token_price - 1.0).abs() < 1e-12);

    // One BULL reading is not enough: the stability window still holds NEUTRAL.
    for hour in 1..=2 {
        let report = eval(&mut engine, 52_500.0, 3_150.0, t0() + Duration::hours(hour));
        assert_eq!(report.result.regime, Regime::Bull);
        assert!(report.rebalance_started.is_none());
        assert_eq!(report.result.target_regime, Regime::Neutral);
    }

    let started = eval(&mut engine, 52_500.0, 3_150.0, t0() + Duration::hours(3));
    let start = started.rebalance_started.expect("rebalance should start");
    assert_eq!(start.target_regime, Regime::Bull);
    assert!(!start.emergency);
    assert_eq!(started.result.target_regime, Regime::Bull);
    assert_eq!(started.result.target_weights, WeightPresets::default().bull);
    // Crypto is 18% of NEUTRAL, up 5%.
    assert!((started.result.token_price - 1.009).abs() < 1e-9);
    assert!(!started.result.breaker_tripped);

    // Weights drift toward the crypto-heavier preset, so the token keeps rising.
    let later = eval(&mut engine, 52_500.0, 3_150.0, t0() + Duration::minutes(210));
    assert!(later.result.rebalance_progress > 0.0);
    assert!(later.result.token_price > started.result.token_price);
    assert!(engine.rebalance_state().is_rebalancing);
}

#[test]
fn crash_trips_breaker_with_countdown() {
    let mut engine = engine();
    eval(&mut engine, 50_000.0, 3_000.0, t0());
    let tripped_at = t0() + Duration::hours(1);
    let crash = eval(&mut engine, 20_000.0, 1_200.0, tripped_at);

    assert!(crash.result.breaker_tripped);
    assert!(crash.rebalance_started.is_none());
    assert_eq!(crash.events.len(), 1);
    assert_eq!(crash.events[0].kind, BreakerEventKind::Tripped);
    assert_eq!(crash.events[0].code, "EXTREME_VOLATILITY");

    let first = engine.breaker_status(tripped_at + Duration::minutes(1));
    let second = engine.breaker_status(tripped_at + Duration::minutes(2));
    assert!(first.tripped && second.tripped);
    assert_eq!(first.time_remaining, Duration::minutes(59).num_milliseconds());
    assert!(second.time_remaining < first.time_remaining);
    assert!(first.can_manual_override);
}

#[test]
fn breaker_does_not_rearm_while_tripped() {
    let mut engine = engine();
    eval(&mut engine, 50_000.0, 3_000.0, t0());
    eval(&mut engine, 20_000.0, 1_200.0, t0() + Duration::hours(1));
    let again = eval(&mut engine, 15_000.0, 900.0, t0() + Duration::minutes(65));
    assert!(again.result.breaker_tripped);
    assert!(again.events.is_empty());
}

#[test]
fn manual_unfreeze_resumes_rebalancing() {
    let mut engine = engine();
    eval(&mut engine, 50_000.0, 3_000.0, t0());
    eval(&mut engine, 20_000.0, 1_200.0, t0() + Duration::hours(1));

    let unfrozen_at = t0() + Duration::minutes(65);
    assert!(!engine.manual_unfreeze("someone-else", unfrozen_at).success);
    assert!(engine.is_breaker_tripped());

    let outcome = engine.manual_unfreeze(GOV, unfrozen_at);
    assert!(outcome.success, "{}", outcome.message);
    assert!(!engine.is_breaker_tripped());
    assert!(!engine.breaker_status(unfrozen_at).tripped);
    let cleared = engine.drain_events();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].kind, BreakerEventKind::Cleared);

    // -20% over the short window: past the emergency threshold, under the freeze one.
    let next = eval(&mut engine, 40_000.0, 2_400.0, t0() + Duration::hours(3));
    assert!(!next.result.breaker_tripped);
    assert_eq!(next.result.regime, Regime::Bear);
    let start = next.rebalance_started.expect("emergency rebalance");
    assert!(start.emergency);
    assert_eq!(start.target_regime, Regime::Bear);
}

#[test]
fn breaker_clears_at_freeze_ceiling_on_flat_market() {
    let mut engine = engine();
    eval(&mut engine, 50_000.0, 3_000.0, t0());
    eval(&mut engine, 20_000.0, 1_200.0, t0() + Duration::hours(1));

    let report = eval(&mut engine, 20_000.0, 1_200.0, t0() + Duration::hours(26));
    assert!(!report.result.breaker_tripped);
    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].kind, BreakerEventKind::Cleared);
    assert_eq!(report.result.regime, Regime::Neutral);
}

#[test]
fn emergency_pause_freezes_targets_until_ceiling() {
    let mut engine = engine();
    eval(&mut engine, 50_000.0, 3_000.0, t0());
    let paused_at = t0() + Duration::minutes(10);
    assert!(!engine.emergency_pause("nobody", "test", paused_at).success);
    assert!(engine.emergency_pause(GOV, "oracle incident", paused_at).success);

    let status = engine.breaker_status(paused_at);
    assert_eq!(status.code, "MANUAL_EMERGENCY_PAUSE");
    // 6h pause, but the 4h ceiling wins.
    assert_eq!(status.time_remaining, Duration::hours(4).num_milliseconds());

    // A strong rally during the pause does not move the target.
    let frozen = eval(&mut engine, 60_000.0, 3_600.0, t0() + Duration::hours(1));
    assert!(frozen.result.breaker_tripped);
    assert!(frozen.rebalance_started.is_none());
    assert_eq!(frozen.result.target_regime, Regime::Neutral);
}

#[test]
fn manual_override_suppresses_automatic_trips() {
    let mut engine = engine();
    eval(&mut engine, 50_000.0, 3_000.0, t0());
    let at = t0() + Duration::minutes(30);
    assert!(engine.manual_override(GOV, "planned migration", at).success);
    assert!(engine.breaker_status(at).override_active);

    let crash = eval(&mut engine, 20_000.0, 1_200.0, t0() + Duration::hours(1));
    assert!(!crash.result.breaker_tripped);
}

#[test]
fn missing_crypto_symbol_values_at_baseline_ratio() {
    let mut engine = engine();
    eval(&mut engine, 50_000.0, 3_000.0, t0());

    let now = t0() + Duration::minutes(1);
    let mut partial = snapshot(50_000.0, 3_000.0, now);
    partial.crypto.retain(|a| a.symbol != "BTC/USD");
    let report = engine.evaluate(&partial, &BTreeMap::new(), &[], now);
    assert!((report.result.basket_value - 10_000.0).abs() < 1e-6);
    assert!((report.result.token_price - 1.0).abs() < 1e-12);
}

#[test]
fn evaluation_is_deterministic_across_instances() {
    let run = || {
        let mut engine = engine();
        eval(&mut engine, 50_000.0, 3_000.0, t0());
        eval(&mut engine, 51_000.0, 3_030.0, t0() + Duration::minutes(30)).result
    };
    let a = run();
    let b = run();
    assert_eq!(a.basket_value, b.basket_value);
    assert_eq!(a.token_price, b.token_price);
    assert_eq!(a.weights, b.weights);
}

#[test]
fn half_way_through_rebalance_weights_are_midpoints() {
    let presets = WeightPresets::default();
    let mut rebalance = RebalanceEngine::new(RebalanceConfig::default(), presets.clone());
    let detector = MarketConditionDetector::new(Default::default());

    // A move past the emergency threshold starts without a stability history.
    let start = rebalance.update(Regime::Bull, 16.0, &detector, t0());
    assert!(start.is_some());

    let mid = rebalance.progress(t0() + Duration::hours(12));
    assert!((mid.progress - 0.5).abs() < 1e-12);
    for (symbol, neutral) in presets.neutral.iter() {
        let expected = (neutral + presets.bull.get(symbol)) / 2.0;
        assert!(
            (mid.weights.get(symbol) - expected).abs() < 1e-12,
            "{} at {} expected {}",
            symbol,
            mid.weights.get(symbol),
            expected
        );
    }
    assert!((mid.weights.total() - 1.0).abs() < 1e-9);

    let done = rebalance.advance(t0() + Duration::hours(24));
    assert!(done.complete);
    assert_eq!(done.weights, presets.bull);
    assert!(!rebalance.cooldown_elapsed(t0() + Duration::hours(25)));
    assert!(rebalance.initiate(Regime::Bear, false, t0() + Duration::hours(25)).is_none());
    assert!(rebalance.initiate(Regime::Bear, true, t0() + Duration::hours(25)).is_some());
}
