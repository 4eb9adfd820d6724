//! Periodic drivers around the synchronous engine.
//!
//! Three independent timers share one `Service`: evaluation, swap guard and
//! health. Engine state is only touched under its mutex on the continuation
//! after I/O resolves; the lock is never held across an await.

use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::adapters::database::Database;
use crate::adapters::relay::{PriceUpdate, SwapContract};
use crate::config::ServiceConfig;
use crate::domain::{
    ActionOutcome, BreakerEvent, BreakerStatus, EvaluationResult, HealthReport, PriceSnapshot,
    SwapStatus,
};
use crate::engine::swap_guard::{ContractState, ResumeDecision, SwapPauseController};
use crate::engine::{BasketEngine, CycleReport};
use crate::feeds::{snapshot_quotes, validate_snapshot, PriceFeed, TickerBook};

/// Failures before health reports an issue.
const UNHEALTHY_FAILURES: u32 = 3;

/// Tickers older than this are not used for volume or cross-validation.
const TICKER_MAX_AGE_MINUTES: i64 = 5;

pub struct HealthMonitor {
    running: bool,
    last_successful_update: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    poll_interval: chrono::Duration,
}

impl HealthMonitor {
    pub fn new(poll_interval: chrono::Duration) -> Self {
        Self {
            running: false,
            last_successful_update: None,
            consecutive_failures: 0,
            poll_interval,
        }
    }

    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.last_successful_update = Some(now);
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn check(&self, now: DateTime<Utc>, breaker_tripped: bool, swaps_paused: bool) -> HealthReport {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        if !self.running {
            issues.push("Service is not running".to_string());
        }
        if let Some(last) = self.last_successful_update {
            let age = now - last;
            if age > self.poll_interval * 3 {
                issues.push(format!("Price data is stale ({}s old)", age.num_seconds()));
            }
        }
        if self.consecutive_failures >= UNHEALTHY_FAILURES {
            issues.push(format!("{} consecutive update failures", self.consecutive_failures));
        }
        if breaker_tripped {
            warnings.push("Circuit breaker is active".to_string());
        }
        if swaps_paused {
            warnings.push("Swaps are paused".to_string());
        }

        HealthReport {
            healthy: issues.is_empty(),
            issues,
            warnings,
            running: self.running,
            last_successful_update: self.last_successful_update,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Resets the in-flight flag however the cycle exits.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Service {
    engine: Mutex<BasketEngine>,
    guard: Mutex<SwapPauseController>,
    health: Mutex<HealthMonitor>,
    feed: Arc<dyn PriceFeed>,
    contract: Arc<dyn SwapContract>,
    tickers: TickerBook,
    db: Option<Database>,
    settings: ServiceConfig,
    price_decimals: u32,
    governance_authorities: Vec<String>,
    oracle_validation: bool,
    in_flight: AtomicBool,
    shutdown: Arc<AtomicBool>,
}

impl Service {
    pub fn new(
        engine: BasketEngine,
        feed: Arc<dyn PriceFeed>,
        contract: Arc<dyn SwapContract>,
        settings: ServiceConfig,
        price_decimals: u32,
    ) -> Self {
        let breaker = &engine.config().breaker;
        let governance_authorities = breaker.governance_authorities.clone();
        let oracle_validation = breaker.oracle_validation;
        let guard = SwapPauseController::new(engine.config().swap_guard.clone());
        let poll = chrono::Duration::seconds(settings.evaluation_interval_secs as i64);

        Self {
            engine: Mutex::new(engine),
            guard: Mutex::new(guard),
            health: Mutex::new(HealthMonitor::new(poll)),
            feed,
            contract,
            tickers: TickerBook::new(),
            db: None,
            settings,
            price_decimals,
            governance_authorities,
            oracle_validation,
            in_flight: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_tickers(mut self, tickers: TickerBook) -> Self {
        self.tickers = tickers;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown(&self) {
        info!("Shutdown requested, timers will not reschedule");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.io_timeout_secs)
    }

    async fn with_timeout<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.io_timeout(), fut)
            .await
            .map_err(|_| eyre::eyre!("{} timed out after {:?}", what, self.io_timeout()))?
    }

    fn is_authorized(&self, authority: &str) -> bool {
        self.governance_authorities.iter().any(|a| a == authority)
    }

    /// Restore a persisted baseline so a restart does not silently re-baseline.
    pub async fn restore_baseline(&self) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        if let Some((prices, captured_at)) = db.load_baseline().await? {
            self.engine.lock().await.restore_baseline(prices, captured_at);
        }
        Ok(())
    }

    // --- Evaluation ---

    /// One evaluation cycle. `Ok(None)` when another cycle is still in flight.
    pub async fn run_cycle(&self) -> Result<Option<EvaluationResult>> {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            debug!("Evaluation still in flight, skipping tick");
            return Ok(None);
        };

        let snapshot = match self.fetch_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.record_fetch_failure(&e).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let max_age = chrono::Duration::minutes(TICKER_MAX_AGE_MINUTES);
        let volumes = self.tickers.volumes(now, max_age).await;
        let quotes = if self.oracle_validation {
            let mut quotes = snapshot_quotes(&snapshot, self.feed.name());
            quotes.extend(self.tickers.quotes("binance").await);
            quotes
        } else {
            Vec::new()
        };

        let report = {
            let mut engine = self.engine.lock().await;
            engine.record_fetch_success();
            engine.evaluate(&snapshot, &volumes, &quotes, now)
        };
        self.health.lock().await.record_success(now);

        self.persist_cycle(&report).await;
        self.publish(&report.result, &snapshot).await;
        Ok(Some(report.result))
    }

    async fn fetch_snapshot(&self) -> Result<PriceSnapshot> {
        let snapshot = self
            .with_timeout("price fetch", self.feed.fetch())
            .await
            .wrap_err_with(|| format!("{} feed failed", self.feed.name()))?;
        validate_snapshot(&snapshot)?;
        Ok(snapshot)
    }

    async fn record_fetch_failure(&self, e: &eyre::Report) {
        self.health.lock().await.record_failure();
        let events = {
            let mut engine = self.engine.lock().await;
            engine.record_fetch_failure(&format!("{:#}", e), Utc::now());
            engine.drain_events()
        };
        self.persist_events(&events).await;
    }

    async fn persist_cycle(&self, report: &CycleReport) {
        self.persist_events(&report.events).await;

        let Some(db) = &self.db else {
            return;
        };
        if let Some(prices) = &report.baseline_captured {
            if let Err(e) = db.save_baseline(prices, report.result.timestamp).await {
                warn!("Failed to persist baseline: {:?}", e);
            }
        }
        if let Err(e) = db.insert_evaluation(&report.result).await {
            warn!("Failed to persist evaluation: {:?}", e);
        }
    }

    async fn persist_events(&self, events: &[BreakerEvent]) {
        for event in events {
            info!("Breaker event {} [{}]: {}", event.kind, event.code, event.message);
            if let Some(db) = &self.db {
                if let Err(e) = db.insert_breaker_event(event).await {
                    warn!("Failed to persist breaker event {}: {:?}", event.id, e);
                }
            }
        }
    }

    /// Push the reference price on-chain unless tripped or paused.
    async fn publish(&self, result: &EvaluationResult, snapshot: &PriceSnapshot) {
        if result.breaker_tripped {
            debug!("Breaker tripped, withholding price update");
            return;
        }
        if !self.guard.lock().await.should_refresh() {
            debug!("Swaps paused, withholding price update");
            return;
        }

        let update = PriceUpdate::new(
            result.token_price,
            snapshot.find("USDC/USD").map(|a| a.price),
            snapshot.find("USDT/USD").map(|a| a.price),
            self.price_decimals,
        );
        match self
            .with_timeout("price publish", self.contract.publish_prices(&update))
            .await
        {
            Ok(signature) => debug!("Published APM price {} (tx {})", update.apm_price, signature),
            Err(e) => error!("Failed to publish prices: {:?}", e),
        }
    }

    // --- Swap guard ---

    async fn contract_state(&self) -> Option<ContractState> {
        match self
            .with_timeout("swap state fetch", self.contract.fetch_state())
            .await
        {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Could not fetch swap state: {:?}", e);
                None
            }
        }
    }

    /// Volatility watch plus auto-resume, on its own timer.
    pub async fn run_swap_guard_cycle(&self) {
        let state = self.contract_state().await;
        let tripped = self.engine.lock().await.is_breaker_tripped();
        let now = Utc::now();

        let decision = {
            let mut guard = self.guard.lock().await;
            if let Some(state) = &state {
                guard.observe(state, tripped, now);
            }
            guard.auto_resume_decision(tripped, now)
        };

        match decision {
            ResumeDecision::Resume(reason) | ResumeDecision::ForceResume(reason) => {
                let outcome = self.resume_swaps(false, &reason).await;
                if !outcome.success {
                    warn!("Automatic resume failed: {}", outcome.message);
                }
            }
            ResumeDecision::Extended(_) | ResumeDecision::Hold => {}
        }
    }

    async fn resume_swaps(&self, manual: bool, reason: &str) -> ActionOutcome {
        if !self.guard.lock().await.is_paused() {
            return ActionOutcome::conflict("Swaps are not paused");
        }
        match self
            .with_timeout("price validity extension", self.contract.extend_price_validity())
            .await
        {
            Ok(_) => {
                self.guard.lock().await.complete_resume(manual, reason);
                ActionOutcome::ok("Swaps resumed")
            }
            Err(e) => {
                error!("❌ Failed to resume swaps: {:?}", e);
                ActionOutcome::unavailable(format!("Resume failed: {:#}", e))
            }
        }
    }

    pub async fn manual_resume(&self, authority: &str, reason: &str) -> ActionOutcome {
        if !self.is_authorized(authority) {
            warn!("🚫 Unauthorized swap resume attempt by {}", authority);
            return ActionOutcome::unauthorized(authority);
        }
        let reason = format!("Manual resume by {}: {}", authority, reason);
        self.resume_swaps(true, &reason).await
    }

    pub async fn swap_status(&self) -> SwapStatus {
        let state = self.contract_state().await;
        let tripped = self.engine.lock().await.is_breaker_tripped();
        self.guard
            .lock()
            .await
            .swaps_allowed(state.as_ref(), tripped, Utc::now())
    }

    // --- Status and admin ---

    pub async fn last_result(&self) -> Option<EvaluationResult> {
        self.engine.lock().await.last_result().cloned()
    }

    pub async fn breaker_status(&self) -> BreakerStatus {
        self.engine.lock().await.breaker_status(Utc::now())
    }

    pub async fn health_check(&self) -> HealthReport {
        let tripped = self.engine.lock().await.is_breaker_tripped();
        let paused = self.guard.lock().await.is_paused();
        self.health.lock().await.check(Utc::now(), tripped, paused)
    }

    pub async fn reset_baseline(&self) -> ActionOutcome {
        let outcome = self.engine.lock().await.reset_baseline();
        if let Some(db) = &self.db {
            if let Err(e) = db.clear_baseline().await {
                warn!("Failed to clear persisted baseline: {:?}", e);
            }
        }
        outcome
    }

    /// Run a breaker admin action and persist whatever transitions it caused.
    async fn breaker_action(
        &self,
        action: impl FnOnce(&mut BasketEngine, DateTime<Utc>) -> ActionOutcome,
    ) -> ActionOutcome {
        let (outcome, events) = {
            let mut engine = self.engine.lock().await;
            let outcome = action(&mut engine, Utc::now());
            (outcome, engine.drain_events())
        };
        self.persist_events(&events).await;
        outcome
    }

    pub async fn manual_unfreeze(&self, authority: &str) -> ActionOutcome {
        self.breaker_action(|engine, now| engine.manual_unfreeze(authority, now))
            .await
    }

    pub async fn emergency_pause(&self, authority: &str, reason: &str) -> ActionOutcome {
        self.breaker_action(|engine, now| engine.emergency_pause(authority, reason, now))
            .await
    }

    pub async fn manual_override(&self, authority: &str, reason: &str) -> ActionOutcome {
        self.breaker_action(|engine, now| engine.manual_override(authority, reason, now))
            .await
    }

    // --- Timers ---

    pub async fn run_evaluation_loop(self: Arc<Self>) {
        self.health.lock().await.set_running(true);
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.settings.evaluation_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Evaluation loop started ({}s interval)",
            self.settings.evaluation_interval_secs
        );

        loop {
            interval.tick().await;
            if self.is_shutting_down() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                error!("Evaluation cycle failed: {:#}", e);
            }
        }
        self.health.lock().await.set_running(false);
        info!("Evaluation loop stopped");
    }

    pub async fn run_swap_guard_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.settings.swap_guard_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("🚨 Swap guard monitoring started");

        loop {
            interval.tick().await;
            if self.is_shutting_down() {
                break;
            }
            self.run_swap_guard_cycle().await;
        }
        info!("🛑 Swap guard monitoring stopped");
    }

    pub async fn run_health_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.settings.health_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if self.is_shutting_down() {
                break;
            }
            let report = self.health_check().await;
            if report.healthy {
                info!("💚 Healthy ({} warnings)", report.warnings.len());
            } else {
                warn!("Unhealthy: {}", report.issues.join("; "));
            }
            for warning in &report.warnings {
                warn!("{}", warning);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_issues_and_warnings() {
        let now = Utc::now();
        let mut monitor = HealthMonitor::new(chrono::Duration::seconds(30));
        let report = monitor.check(now, false, false);
        assert!(!report.healthy);
        assert_eq!(report.issues.len(), 1);

        monitor.set_running(true);
        monitor.record_success(now);
        assert!(monitor.check(now + chrono::Duration::seconds(60), false, false).healthy);

        let stale = monitor.check(now + chrono::Duration::seconds(91), true, true);
        assert!(!stale.healthy);
        assert_eq!(stale.warnings.len(), 2);

        for _ in 0..3 {
            monitor.record_failure();
        }
        let failing = monitor.check(now, false, false);
        assert!(failing.issues.iter().any(|i| i.contains("3 consecutive")));
    }

    #[test]
    fn test_in_flight_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let first = InFlight::acquire(&flag);
        assert!(first.is_some());
        assert!(InFlight::acquire(&flag).is_none());
        drop(first);
        assert!(InFlight::acquire(&flag).is_some());
    }
}
