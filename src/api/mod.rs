use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;

use crate::domain::{
    ActionOutcome, BreakerStatus, EvaluationResult, HealthReport, Rejection, SwapStatus,
};
use crate::service::Service;

pub struct AppState {
    pub service: Arc<Service>,
    pub start_time: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/breaker", get(breaker))
        .route("/api/swap", get(swap))
        .route("/api/evaluate", post(evaluate))
        .route("/api/baseline/reset", post(reset_baseline))
        .route("/api/breaker/unfreeze", post(unfreeze))
        .route("/api/breaker/pause", post(emergency_pause))
        .route("/api/breaker/override", post(manual_override))
        .route("/api/swap/resume", post(resume_swaps))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct GovernanceRequest {
    pub authority: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Serialize)]
struct StatusResponse {
    last_result: Option<EvaluationResult>,
    health: HealthReport,
    uptime_secs: u64,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        last_result: state.service.last_result().await,
        health: state.service.health_check().await,
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn breaker(State(state): State<Arc<AppState>>) -> Json<BreakerStatus> {
    Json(state.service.breaker_status().await)
}

async fn swap(State(state): State<Arc<AppState>>) -> Json<SwapStatus> {
    Json(state.service.swap_status().await)
}

/// Runs a cycle now. 409 when one is already in flight, 502 when the feed fails.
async fn evaluate(
    State(state): State<Arc<AppState>>,
) -> Result<Json<EvaluationResult>, (StatusCode, Json<ActionOutcome>)> {
    match state.service.run_cycle().await {
        Ok(Some(result)) => Ok(Json(result)),
        Ok(None) => Err((
            StatusCode::CONFLICT,
            Json(ActionOutcome::conflict("Evaluation already in progress")),
        )),
        Err(e) => Err((
            StatusCode::BAD_GATEWAY,
            Json(ActionOutcome::unavailable(format!("{:#}", e))),
        )),
    }
}

/// Refused actions carry the outcome as body: 403 for an unknown authority,
/// 409 when the action does not apply right now, 502 when a downstream call failed.
fn respond(outcome: ActionOutcome) -> (StatusCode, Json<ActionOutcome>) {
    let code = match outcome.rejection {
        None => StatusCode::OK,
        Some(Rejection::Unauthorized) => StatusCode::FORBIDDEN,
        Some(Rejection::Conflict) => StatusCode::CONFLICT,
        Some(Rejection::Unavailable) => StatusCode::BAD_GATEWAY,
    };
    (code, Json(outcome))
}

async fn reset_baseline(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ActionOutcome>) {
    respond(state.service.reset_baseline().await)
}

async fn unfreeze(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GovernanceRequest>,
) -> (StatusCode, Json<ActionOutcome>) {
    respond(state.service.manual_unfreeze(&req.authority).await)
}

async fn emergency_pause(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GovernanceRequest>,
) -> (StatusCode, Json<ActionOutcome>) {
    respond(state.service.emergency_pause(&req.authority, &req.reason).await)
}

async fn manual_override(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GovernanceRequest>,
) -> (StatusCode, Json<ActionOutcome>) {
    respond(state.service.manual_override(&req.authority, &req.reason).await)
}

async fn resume_swaps(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GovernanceRequest>,
) -> (StatusCode, Json<ActionOutcome>) {
    respond(state.service.manual_resume(&req.authority, &req.reason).await)
}
