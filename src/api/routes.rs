//! Route handlers for the payout API.

use super::{ApiError, AppState};
use crate::models::{
    Alert, AuditEvent, CreatePayoutRequest, Payout, PayoutFilter, PayoutStats, PayoutStatus,
    RetryLogEntry,
};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/payouts", post(create_payout).get(list_payouts))
        .route("/api/payouts/stats", get(payout_stats))
        .route("/api/payouts/:id", get(get_payout))
        .route("/api/payouts/:id/audit", get(payout_audit))
        .route("/api/payouts/:id/retries", get(payout_retries))
        .route("/api/payouts/:id/cancel", post(cancel_payout))
        .route("/api/payouts/:id/retry", post(retry_payout))
        .route("/api/alerts", get(list_alerts))
        .route("/api/alerts/:id/resolve", post(resolve_alert))
        .route("/api/connectors/health", get(connectors_health))
        .route("/api/settlements/confirm", post(confirm_settlement))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn create_payout(
    State(state): State<AppState>,
    Json(request): Json<CreatePayoutRequest>,
) -> Result<Json<Payout>, ApiError> {
    let payout = state.service.create_payout(&request).await?;
    Ok(Json(payout))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    tenant_id: Option<String>,
    status: Option<String>,
    beneficiary_id: Option<String>,
    created_after: Option<i64>,
    created_before: Option<i64>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    payouts: Vec<Payout>,
    total: u64,
    limit: usize,
    offset: usize,
}

async fn list_payouts(
    State(state): State<AppState>,
    Query(params): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let filter = PayoutFilter {
        tenant_id: params.tenant_id,
        status: params.status.as_deref().and_then(PayoutStatus::from_str),
        beneficiary_id: params.beneficiary_id,
        created_after: params.created_after,
        created_before: params.created_before,
    };
    let limit = params.limit.unwrap_or(50);
    let offset = params.offset.unwrap_or(0);
    let (payouts, total) = state.service.list(&filter, limit, offset)?;
    Ok(Json(ListResponse {
        payouts,
        total,
        limit,
        offset,
    }))
}

async fn get_payout(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Payout>, ApiError> {
    Ok(Json(state.service.get(&id)?))
}

async fn payout_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    // 404 for unknown payouts rather than an empty trail.
    state.service.get(&id)?;
    Ok(Json(state.service.audit_trail(&id)?))
}

async fn payout_retries(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<RetryLogEntry>>, ApiError> {
    state.service.get(&id)?;
    Ok(Json(state.service.retry_log(&id)?))
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    reason: String,
    #[serde(default)]
    actor: Option<String>,
}

async fn cancel_payout(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<Payout>, ApiError> {
    let payout = state
        .service
        .cancel(&id, &request.reason, request.actor.as_deref())
        .await?;
    Ok(Json(payout))
}

#[derive(Debug, Deserialize, Default)]
struct RetryRequest {
    #[serde(default)]
    actor: Option<String>,
}

async fn retry_payout(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<RetryRequest>>,
) -> Result<Json<Payout>, ApiError> {
    let actor = request.as_ref().and_then(|r| r.actor.clone());
    let payout = state.service.retry(&id, actor.as_deref()).await?;
    Ok(Json(payout))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    tenant_id: String,
}

async fn payout_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<PayoutStats>, ApiError> {
    Ok(Json(state.service.stats(&params.tenant_id)?))
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    resolved: Option<bool>,
    limit: Option<usize>,
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertsQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    Ok(Json(
        state
            .service
            .list_alerts(params.resolved, params.limit.unwrap_or(100))?,
    ))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    actor: Option<String>,
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Alert>, ApiError> {
    Ok(Json(state.service.resolve_alert(
        &id,
        request.note.as_deref(),
        request.actor.as_deref(),
    )?))
}

async fn connectors_health(
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let snapshot = state.connectors.health_snapshot().await;
    Json(serde_json::json!({
        "connectors": snapshot,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct SettlementConfirmation {
    bank_reference: String,
    success: bool,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

async fn confirm_settlement(
    State(state): State<AppState>,
    Json(confirmation): Json<SettlementConfirmation>,
) -> Result<Json<Payout>, ApiError> {
    let payout = state
        .service
        .confirm_settlement(
            &confirmation.bank_reference,
            confirmation.success,
            confirmation.details,
        )
        .await?;
    Ok(Json(payout))
}
