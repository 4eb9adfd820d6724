use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;
use tower::ServiceExt;

use apm_engine::adapters::database::Database;
use apm_engine::adapters::relay::{PriceUpdate, SwapContract};
use apm_engine::api::{router, AppState};
use apm_engine::config::{EngineConfig, ServiceConfig};
use apm_engine::domain::{AssetPrice, PriceSnapshot, TickerUpdate};
use apm_engine::engine::swap_guard::ContractState;
use apm_engine::engine::BasketEngine;
use apm_engine::feeds::{PriceFeed, TickerBook};
use apm_engine::service::Service;

const GOV: &str = "gov-multisig";

/// Serves a fixed snapshot, BTC adjustable, until told to fail. A test holding
/// `gate` keeps every fetch open; `entered` fires when one is waiting on it.
struct MockFeed {
    failing: Mutex<bool>,
    btc: Mutex<f64>,
    gate: tokio::sync::Mutex<()>,
    entered: Notify,
}

#[async_trait]
impl PriceFeed for MockFeed {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch(&self) -> eyre::Result<PriceSnapshot> {
        self.entered.notify_one();
        drop(self.gate.lock().await);
        if *self.failing.lock().unwrap() {
            eyre::bail!("upstream unavailable");
        }
        let now = Utc::now();
        Ok(PriceSnapshot {
            crypto: vec![
                AssetPrice::new("BTC/USD", *self.btc.lock().unwrap(), now),
                AssetPrice::new("ETH/USD", 3_200.0, now),
            ],
            precious_metals: vec![
                AssetPrice::new("XAU/USD", 2_400.0, now),
                AssetPrice::new("XAG/USD", 28.0, now),
            ],
            stablecoins: vec![AssetPrice::new("USDC/USD", 0.9998, now)],
            forex: vec![
                AssetPrice::new("EUR/USD", 1.09, now),
                AssetPrice::new("GBP/USD", 1.28, now),
            ],
        })
    }
}

#[derive(Default)]
struct MockContract {
    published: Mutex<Vec<PriceUpdate>>,
    extensions: Mutex<u32>,
}

#[async_trait]
impl SwapContract for MockContract {
    async fn fetch_state(&self) -> eyre::Result<ContractState> {
        Ok(ContractState {
            apm_price: 1.0,
            usdc_price: 1.0,
            usdt_price: 1.0,
            active: true,
            price_valid_until: Some(Utc::now() + Duration::hours(1)),
        })
    }

    async fn extend_price_validity(&self) -> eyre::Result<String> {
        *self.extensions.lock().unwrap() += 1;
        Ok("tx-extend".to_string())
    }

    async fn publish_prices(&self, update: &PriceUpdate) -> eyre::Result<String> {
        self.published.lock().unwrap().push(*update);
        Ok("tx-publish".to_string())
    }
}

struct Harness {
    app: Router,
    service: Arc<Service>,
    feed: Arc<MockFeed>,
    contract: Arc<MockContract>,
    db: Database,
}

async fn harness() -> Harness {
    harness_with(EngineConfig::default(), TickerBook::new()).await
}

async fn harness_with(mut cfg: EngineConfig, tickers: TickerBook) -> Harness {
    cfg.breaker.governance_authorities = vec![GOV.to_string()];
    let engine = BasketEngine::new(cfg).unwrap();

    let feed = Arc::new(MockFeed {
        failing: Mutex::new(false),
        btc: Mutex::new(60_000.0),
        gate: tokio::sync::Mutex::new(()),
        entered: Notify::new(),
    });
    let contract = Arc::new(MockContract::default());
    let db = Database::connect("sqlite::memory:").await.unwrap();

    let service = Arc::new(
        Service::new(engine, feed.clone(), contract.clone(), ServiceConfig::default(), 8)
            .with_database(db.clone())
            .with_tickers(tickers),
    );
    let app = router(Arc::new(AppState {
        service: service.clone(),
        start_time: Instant::now(),
    }));

    Harness {
        app,
        service,
        feed,
        contract,
        db,
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn evaluate_publishes_and_persists() {
    let h = harness().await;

    let (status, body) = send(&h.app, "POST", "/api/evaluate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["regime"], "NEUTRAL");
    assert!((body["token_price"].as_f64().unwrap() - 1.0).abs() < 1e-12);

    let published = h.contract.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].apm_price, 100_000_000);
    assert_eq!(published[0].usdc_price, 99_980_000);
    // Missing USDT is published at par.
    assert_eq!(published[0].usdt_price, 100_000_000);

    assert_eq!(h.db.count_evaluations().await.unwrap(), 1);
    assert!(h.db.load_baseline().await.unwrap().is_some());

    let (status, body) = send(&h.app, "GET", "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["last_result"]["target_regime"], "NEUTRAL");
    assert_eq!(body["health"]["consecutive_failures"], 0);
}

#[tokio::test]
async fn failed_fetch_is_counted_not_fatal() {
    let h = harness().await;
    *h.feed.failing.lock().unwrap() = true;

    let (status, body) = send(&h.app, "POST", "/api/evaluate", None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);

    let health = h.service.health_check().await;
    assert_eq!(health.consecutive_failures, 1);
    assert_eq!(h.service.breaker_status().await.metrics.fetch_failures, 1);
    assert!(h.contract.published.lock().unwrap().is_empty());

    *h.feed.failing.lock().unwrap() = false;
    let (status, _) = send(&h.app, "POST", "/api/evaluate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.service.health_check().await.consecutive_failures, 0);
    assert_eq!(h.service.breaker_status().await.metrics.fetch_failures, 0);
}

#[tokio::test]
async fn governance_actions_require_allow_listed_authority() {
    let h = harness().await;
    send(&h.app, "POST", "/api/evaluate", None).await;

    let pause = serde_json::json!({ "authority": "intruder", "reason": "x" });
    let (status, body) = send(&h.app, "POST", "/api/breaker/pause", Some(pause)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);

    let pause = serde_json::json!({ "authority": GOV, "reason": "oracle incident" });
    let (status, _) = send(&h.app, "POST", "/api/breaker/pause", Some(pause)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, breaker) = send(&h.app, "GET", "/api/breaker", None).await;
    assert_eq!(breaker["tripped"], true);
    assert_eq!(breaker["code"], "MANUAL_EMERGENCY_PAUSE");
    assert!(breaker["time_remaining"].as_i64().unwrap() > 0);

    // Tripped: the cycle still runs but nothing is published.
    let (status, body) = send(&h.app, "POST", "/api/evaluate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["breaker_tripped"], true);
    assert_eq!(h.contract.published.lock().unwrap().len(), 1);

    let unfreeze = serde_json::json!({ "authority": GOV });
    let (status, _) = send(&h.app, "POST", "/api/breaker/unfreeze", Some(unfreeze)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!h.service.breaker_status().await.tripped);

    let events = h.db.recent_breaker_events(10).await.unwrap();
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn swap_guard_pauses_on_trip_and_resumes_on_governance_call() {
    let h = harness().await;

    let (_, swap) = send(&h.app, "GET", "/api/swap", None).await;
    assert_eq!(swap["allowed"], true);

    h.service.emergency_pause(GOV, "drill").await;
    h.service.run_swap_guard_cycle().await;

    let (_, swap) = send(&h.app, "GET", "/api/swap", None).await;
    assert_eq!(swap["allowed"], false);
    assert_eq!(swap["blocked_by"], "local_pause");

    // Paused swaps withhold publishing even once the breaker is clear.
    h.service.manual_unfreeze(GOV).await;
    send(&h.app, "POST", "/api/evaluate", None).await;
    assert!(h.contract.published.lock().unwrap().is_empty());

    let resume = serde_json::json!({ "authority": "intruder", "reason": "x" });
    let (status, _) = send(&h.app, "POST", "/api/swap/resume", Some(resume)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let resume = serde_json::json!({ "authority": GOV, "reason": "drill over" });
    let (status, body) = send(&h.app, "POST", "/api/swap/resume", Some(resume)).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(*h.contract.extensions.lock().unwrap(), 1);

    let (_, swap) = send(&h.app, "GET", "/api/swap", None).await;
    assert_eq!(swap["allowed"], true);
}

#[tokio::test]
async fn baseline_reset_clears_persisted_baseline() {
    let h = harness().await;
    send(&h.app, "POST", "/api/evaluate", None).await;
    assert!(h.db.load_baseline().await.unwrap().is_some());

    let (status, body) = send(&h.app, "POST", "/api/baseline/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(h.db.load_baseline().await.unwrap().is_none());

    send(&h.app, "POST", "/api/evaluate", None).await;
    assert!(h.db.load_baseline().await.unwrap().is_some());
}

#[tokio::test]
async fn restored_baseline_survives_restart() {
    let h = harness().await;
    send(&h.app, "POST", "/api/evaluate", None).await;

    let engine = BasketEngine::new(EngineConfig::default()).unwrap();
    let restarted = Service::new(engine, h.feed.clone(), h.contract.clone(), ServiceConfig::default(), 8)
        .with_database(h.db.clone());
    restarted.restore_baseline().await.unwrap();

    *h.feed.btc.lock().unwrap() = 66_000.0;
    let result = restarted.run_cycle().await.unwrap().unwrap();

    // Valued against the first process's baseline, not re-baselined at par.
    assert!(result.token_price > 1.0);
    let (stored, _) = h.db.load_baseline().await.unwrap().unwrap();
    assert_eq!(stored["BTC/USD"], 60_000.0);
    assert_eq!(h.db.count_evaluations().await.unwrap(), 2);
}

#[tokio::test]
async fn evaluate_while_a_cycle_is_in_flight_is_a_conflict() {
    let h = harness().await;
    let held = h.feed.gate.lock().await;

    let service = h.service.clone();
    let first = tokio::spawn(async move { service.run_cycle().await });
    h.feed.entered.notified().await;

    let (status, body) = send(&h.app, "POST", "/api/evaluate", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert!(h.service.run_cycle().await.unwrap().is_none());

    drop(held);
    let result = first.await.unwrap().unwrap();
    assert!(result.is_some());
    assert_eq!(h.db.count_evaluations().await.unwrap(), 1);

    // The slot is free again once the held cycle finishes.
    let (status, _) = send(&h.app, "POST", "/api/evaluate", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn resume_while_swaps_run_is_a_conflict_not_a_denial() {
    let h = harness().await;

    let resume = serde_json::json!({ "authority": GOV, "reason": "nothing to resume" });
    let (status, body) = send(&h.app, "POST", "/api/swap/resume", Some(resume)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], "Swaps are not paused");
    assert_eq!(*h.contract.extensions.lock().unwrap(), 0);

    let unfreeze = serde_json::json!({ "authority": GOV });
    let (status, _) = send(&h.app, "POST", "/api/breaker/unfreeze", Some(unfreeze)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

async fn tick(tickers: &TickerBook, symbol: &str, price: f64) {
    tickers
        .insert(TickerUpdate {
            symbol: symbol.to_string(),
            price,
            volume: 12.0,
            timestamp: Utc::now(),
        })
        .await;
}

#[tokio::test]
async fn oracle_validation_stays_clear_when_sources_agree() {
    let mut cfg = EngineConfig::default();
    cfg.breaker.oracle_validation = true;
    let tickers = TickerBook::new();
    let h = harness_with(cfg, tickers.clone()).await;

    // Binance covers only BTC and ETH; everything else has the primary feed alone.
    for _ in 0..8 {
        tick(&tickers, "BTC/USD", 60_010.0).await;
        tick(&tickers, "ETH/USD", 3_199.0).await;
        assert!(h.service.run_cycle().await.unwrap().is_some());
    }
    let status = h.service.breaker_status().await;
    assert!(!status.tripped, "{}", status.reason);
    assert_eq!(status.metrics.oracle_failures, 0);
    assert_eq!(h.contract.published.lock().unwrap().len(), 8);

    // A second source that disagrees is still caught.
    tick(&tickers, "BTC/USD", 66_000.0).await;
    let result = h.service.run_cycle().await.unwrap().unwrap();
    assert!(result.breaker_tripped);
    assert_eq!(h.service.breaker_status().await.code, "ORACLE_DEVIATION");
}
