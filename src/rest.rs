// rest.rs — Operator and callback HTTP surface.
//
// Axum server, local only by default.
//
// Endpoints:
//   GET  /api/v1/health
//   GET  /api/v1/tick/status
//   POST /api/v1/tick/enable
//   POST /api/v1/tick/disable
//   POST /api/v1/tick/run
//   GET  /api/v1/circuit-breakers
//   POST /api/v1/circuit-breakers/{key}/reset
//   GET  /api/v1/executor/status
//   POST /api/v1/tasks/{id}/force-retry
//   GET  /api/v1/decisions
//   POST /api/v1/decisions/{id}/execute
//   POST /api/v1/decisions/{id}/rollback
//   GET  /api/v1/events
//   POST /api/v1/callback

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::callback::{handle_run_completion, RunReport};
use crate::error::StewardError;
use crate::events::EventFilter;
use crate::SharedState;

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

fn api_error(err: StewardError) -> ApiError {
    let status = match err {
        StewardError::TaskNotFound(_)
        | StewardError::GoalNotFound(_)
        | StewardError::DecisionNotFound(_) => StatusCode::NOT_FOUND,
        StewardError::DecisionAlreadyExecuted
        | StewardError::DecisionRolledBack
        | StewardError::DecisionNotExecuted(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

pub async fn start_rest_server(state: SharedState) -> anyhow::Result<()> {
    let addr: SocketAddr =
        format!("{}:{}", state.config.bind_address, state.config.port).parse()?;
    let router = build_router(state);

    info!("REST API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/tick/status", get(tick_status))
        .route("/api/v1/tick/enable", post(tick_enable))
        .route("/api/v1/tick/disable", post(tick_disable))
        .route("/api/v1/tick/run", post(tick_run))
        .route("/api/v1/circuit-breakers", get(list_breakers))
        .route("/api/v1/circuit-breakers/{key}/reset", post(reset_breaker))
        .route("/api/v1/executor/status", get(executor_status))
        .route("/api/v1/tasks/{id}/force-retry", post(force_retry))
        .route("/api/v1/decisions", get(list_decisions))
        .route("/api/v1/decisions/{id}/execute", post(execute_decision))
        .route("/api/v1/decisions/{id}/rollback", post(rollback_decision))
        .route("/api/v1/events", get(list_events))
        .route("/api/v1/callback", post(execution_callback))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Health & tick ───────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn tick_status(State(state): State<SharedState>) -> ApiResult {
    let status = state.tick.status().await.map_err(api_error)?;
    Ok(Json(json!(status)))
}

async fn tick_enable(State(state): State<SharedState>) -> ApiResult {
    state.tick.set_enabled(true).await.map_err(api_error)?;
    Ok(Json(json!({ "enabled": true })))
}

async fn tick_disable(State(state): State<SharedState>) -> ApiResult {
    state.tick.set_enabled(false).await.map_err(api_error)?;
    Ok(Json(json!({ "enabled": false })))
}

async fn tick_run(State(state): State<SharedState>) -> Json<Value> {
    let outcome = state.tick.run_tick_safe("manual").await;
    Json(json!(outcome))
}

// ─── Circuit breakers & executor ─────────────────────────────────────────────

async fn list_breakers(State(state): State<SharedState>) -> Json<Value> {
    let states = state.breakers.all_states().await;
    Json(json!({ "breakers": states }))
}

async fn reset_breaker(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Json<Value> {
    state.breakers.reset(&key).await;
    Json(json!({ "key": key, "state": "CLOSED" }))
}

async fn executor_status(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "available": state.executor.available(),
        "binary": state.config.agent.binary,
        "active_runs": state.executor.active_count().await,
    }))
}

// ─── Tasks & decisions ───────────────────────────────────────────────────────

async fn force_retry(State(state): State<SharedState>, Path(id): Path<Uuid>) -> ApiResult {
    let retry = state.retry.force_retry(id).await.map_err(api_error)?;
    Ok(Json(json!({
        "original_task_id": id,
        "retry_task_id": retry.id,
        "title": retry.title,
    })))
}

async fn list_decisions(State(state): State<SharedState>) -> ApiResult {
    let decisions = state.decisions.decision_history(20).await.map_err(api_error)?;
    Ok(Json(json!({ "decisions": decisions })))
}

async fn execute_decision(State(state): State<SharedState>, Path(id): Path<Uuid>) -> ApiResult {
    let results = state.decisions.execute_decision(id).await.map_err(api_error)?;
    Ok(Json(json!({ "decision_id": id, "results": results })))
}

async fn rollback_decision(State(state): State<SharedState>, Path(id): Path<Uuid>) -> ApiResult {
    state.decisions.rollback_decision(id).await.map_err(api_error)?;
    Ok(Json(json!({ "decision_id": id, "status": "rolled_back" })))
}

// ─── Events ──────────────────────────────────────────────────────────────────

async fn list_events(
    State(state): State<SharedState>,
    Query(filter): Query<EventFilter>,
) -> Json<Value> {
    let events = state.events.query(&filter).await;
    Json(json!({ "events": events }))
}

// ─── Execution callback ──────────────────────────────────────────────────────

async fn execution_callback(
    State(state): State<SharedState>,
    Json(report): Json<RunReport>,
) -> ApiResult {
    let outcome = handle_run_completion(&state, report)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "success": true, "result": outcome })))
}
