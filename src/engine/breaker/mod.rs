//! Unified circuit breaker.
//!
//! One trip/clear state machine. Detectors report into it; only the first trip
//! from a clear state arms it, and an armed breaker is never re-armed until it
//! clears. Clear conditions are evaluated before new trips on every check.

pub mod detectors;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::config::BreakerConfig;
use crate::domain::{ActionOutcome, BreakerEvent, BreakerEventKind, BreakerMetrics, BreakerStatus};
use detectors::{default_detectors, Detector, Observation, RebalanceLimits, Trip};

pub const EMERGENCY_PAUSE: &str = "MANUAL_EMERGENCY_PAUSE";
pub const FETCH_FAILURE: &str = "FETCH_FAILURE_THRESHOLD";
const EXTREME_VOLATILITY: &str = "EXTREME_VOLATILITY";

#[derive(Debug, Clone, Default)]
struct TripState {
    tripped: bool,
    code: String,
    reason: String,
    tripped_at: Option<DateTime<Utc>>,
    auto_clear_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    detectors: Vec<Box<dyn Detector>>,
    limits: RebalanceLimits,
    state: TripState,
    override_until: Option<DateTime<Utc>>,
    fetch_failures: u32,
    events: Vec<BreakerEvent>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let detectors = default_detectors(&config);
        Self::with_detectors(config, detectors)
    }

    pub fn with_detectors(config: BreakerConfig, detectors: Vec<Box<dyn Detector>>) -> Self {
        Self {
            limits: RebalanceLimits::new(&config),
            config,
            detectors,
            state: TripState::default(),
            override_until: None,
            fetch_failures: 0,
            events: Vec::new(),
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.state.tripped
    }

    pub fn override_active(&self, now: DateTime<Utc>) -> bool {
        self.override_until.is_some_and(|until| now < until)
    }

    fn is_authorized(&self, authority: &str) -> bool {
        self.config
            .governance_authorities
            .iter()
            .any(|a| a == authority)
    }

    /// Run clear conditions, then every detector. Returns whether the breaker is
    /// tripped afterwards.
    pub fn check(&mut self, obs: &Observation<'_>) -> bool {
        let now = obs.now;
        if self.override_until.is_some_and(|until| now >= until) {
            info!("Manual override expired, automatic checks re-armed");
            self.override_until = None;
        }

        if self.state.tripped {
            self.check_clear(obs.change_percent, now);
        }

        let disarmed = self.override_active(now);
        let mut first: Option<Trip> = None;
        for detector in self.detectors.iter_mut() {
            if let Some(trip) = detector.observe(obs) {
                debug!("{} reported {}: {}", detector.name(), trip.code, trip.reason);
                first.get_or_insert(trip);
            }
        }

        if let Some(trip) = first {
            if disarmed {
                warn!("Manual override active, ignoring {}: {}", trip.code, trip.reason);
            } else {
                self.trip(trip, now);
            }
        }
        self.state.tripped
    }

    fn check_clear(&mut self, change_percent: f64, now: DateTime<Utc>) {
        let Some(tripped_at) = self.state.tripped_at else {
            return;
        };

        if now - tripped_at >= self.config.max_freeze_duration {
            self.clear(
                format!(
                    "Maximum freeze of {} minutes reached",
                    self.config.max_freeze_duration.num_minutes()
                ),
                now,
            );
        } else if !self.override_active(now)
            && self.state.auto_clear_at.is_some_and(|at| now >= at)
        {
            self.clear("Auto-clear timer elapsed".to_string(), now);
        } else if self.config.auto_clear_on_neutral
            && self.state.code == EXTREME_VOLATILITY
            && change_percent.abs() < self.config.neutral_clear_threshold
        {
            self.clear(
                format!("Market returned to neutral ({:.2}%)", change_percent),
                now,
            );
        }
    }

    /// Arm the breaker unless it already is. Returns true if this call armed it.
    pub fn trip(&mut self, trip: Trip, now: DateTime<Utc>) -> bool {
        if self.state.tripped {
            debug!("Breaker already tripped, not re-arming for {}", trip.code);
            return false;
        }
        let duration = trip.duration.unwrap_or(self.config.auto_reset_delay);
        self.arm(trip.code.to_string(), trip.reason, duration, now);
        true
    }

    fn arm(&mut self, code: String, reason: String, duration: Duration, now: DateTime<Utc>) {
        let auto_clear_at = now + duration;
        error!("🚨 CIRCUIT BREAKER TRIPPED [{}]: {}", code, reason);

        self.events.push(BreakerEvent {
            id: uuid::Uuid::new_v4().to_string(),
            kind: BreakerEventKind::Tripped,
            code: code.clone(),
            message: reason.clone(),
            at: now,
            auto_clear_at: Some(auto_clear_at),
        });
        self.state = TripState {
            tripped: true,
            code,
            reason,
            tripped_at: Some(now),
            auto_clear_at: Some(auto_clear_at),
        };
    }

    fn clear(&mut self, message: String, now: DateTime<Utc>) {
        warn!("🔄 Circuit breaker cleared: {}", message);
        let code = std::mem::take(&mut self.state.code);
        self.state = TripState::default();
        self.fetch_failures = 0;
        for detector in self.detectors.iter_mut() {
            detector.reset();
        }
        self.events.push(BreakerEvent {
            id: uuid::Uuid::new_v4().to_string(),
            kind: BreakerEventKind::Cleared,
            code,
            message,
            at: now,
            auto_clear_at: None,
        });
    }

    /// Ledger a rebalance of `notional` and check the abuse limits.
    pub fn record_rebalance(&mut self, notional: f64, now: DateTime<Utc>) -> bool {
        match self.limits.record(notional, now) {
            Some(trip) if !self.override_active(now) => self.trip(trip, now),
            _ => false,
        }
    }

    pub fn record_fetch_failure(&mut self, error: &str, now: DateTime<Utc>) -> bool {
        self.fetch_failures += 1;
        warn!(
            "Price fetch failed ({}/{}): {}",
            self.fetch_failures, self.config.max_consecutive_failures, error
        );
        if self.fetch_failures < self.config.max_consecutive_failures || self.override_active(now) {
            return false;
        }
        self.trip(
            Trip {
                code: FETCH_FAILURE,
                reason: format!(
                    "{} consecutive price fetch failures, last: {}",
                    self.fetch_failures, error
                ),
                duration: None,
            },
            now,
        )
    }

    pub fn record_fetch_success(&mut self) {
        self.fetch_failures = 0;
    }

    pub fn manual_unfreeze(&mut self, authority: &str, now: DateTime<Utc>) -> ActionOutcome {
        if !self.is_authorized(authority) {
            warn!("🚫 Unauthorized unfreeze attempt by {}", authority);
            return ActionOutcome::unauthorized(authority);
        }
        if !self.state.tripped {
            return ActionOutcome::conflict("Circuit breaker is not tripped");
        }
        self.clear(format!("Manual unfreeze by {}", authority), now);
        ActionOutcome::ok("Circuit breaker cleared")
    }

    /// Governance pause. Supersedes any active trip and cancels an override.
    pub fn emergency_pause(
        &mut self,
        authority: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ActionOutcome {
        if !self.is_authorized(authority) {
            warn!("🚫 Unauthorized emergency pause attempt by {}", authority);
            return ActionOutcome::unauthorized(authority);
        }
        self.override_until = None;
        self.arm(
            EMERGENCY_PAUSE.to_string(),
            format!("Manual emergency pause by {}: {}", authority, reason),
            self.config.emergency_pause_duration,
            now,
        );
        ActionOutcome::ok("Emergency pause engaged")
    }

    /// Clear any trip and disarm the automatic detectors until the override times out.
    pub fn manual_override(
        &mut self,
        authority: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ActionOutcome {
        if !self.is_authorized(authority) {
            warn!("🚫 Unauthorized manual override attempt by {}", authority);
            return ActionOutcome::unauthorized(authority);
        }
        if self.state.tripped {
            self.clear(format!("Manual override by {}", authority), now);
        }
        let until = now + self.config.manual_override_timeout;
        self.override_until = Some(until);
        info!("🔧 Manual override by {} until {}: {}", authority, until, reason);
        self.events.push(BreakerEvent {
            id: uuid::Uuid::new_v4().to_string(),
            kind: BreakerEventKind::Override,
            code: "MANUAL_OVERRIDE".to_string(),
            message: format!("{}: {}", authority, reason),
            at: now,
            auto_clear_at: Some(until),
        });
        ActionOutcome::ok(format!("Manual override active until {}", until))
    }

    /// Earliest instant at which the breaker clears without intervention.
    fn effective_clear_at(&self) -> Option<DateTime<Utc>> {
        let ceiling = self.state.tripped_at? + self.config.max_freeze_duration;
        Some(match self.state.auto_clear_at {
            Some(at) => at.min(ceiling),
            None => ceiling,
        })
    }

    pub fn metrics(&self, now: DateTime<Utc>) -> BreakerMetrics {
        BreakerMetrics {
            rebalance_count_24h: self.limits.count_24h(now),
            notional_moved_24h: self.limits.notional_moved_24h(now),
            oracle_failures: self.detectors.iter().map(|d| d.failure_count()).sum(),
            fetch_failures: self.fetch_failures,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> BreakerStatus {
        let time_remaining = match (self.state.tripped, self.effective_clear_at()) {
            (true, Some(at)) => (at - now).num_milliseconds().max(0),
            _ => 0,
        };
        BreakerStatus {
            tripped: self.state.tripped,
            reason: self.state.reason.clone(),
            code: self.state.code.clone(),
            tripped_at: self.state.tripped_at,
            time_remaining,
            can_manual_override: self.state.tripped
                && !self.config.governance_authorities.is_empty(),
            override_active: self.override_active(now),
            override_expires_at: self.override_until.filter(|until| now < *until),
            metrics: self.metrics(now),
        }
    }

    pub fn drain_events(&mut self) -> Vec<BreakerEvent> {
        std::mem::take(&mut self.events)
    }
}
