use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use super::GatewayHttpState;
use super::errors::{OpenAiErrorResponse, openai_error};
use crate::gateway::routing::{
    BackendHealthSnapshot, HealthStatus, RoutingDecisionRecord, RoutingPolicy,
};

type AdminError = (StatusCode, Json<OpenAiErrorResponse>);

pub(super) fn router() -> Router<GatewayHttpState> {
    Router::new()
        .route("/admin/backends", get(list_backends))
        .route("/admin/backends/:id/reset", post(reset_backend))
        .route("/admin/backends/:id/unhealthy", post(mark_backend_unhealthy))
        .route("/admin/routing/decisions", get(list_decisions))
        .route("/admin/routing/policies", get(list_policies))
        .route("/admin/routing/refresh", post(refresh_policies))
        .route("/admin/rate_limits/:tenant/reset", post(reset_rate_limit))
}

fn extract_admin_token(headers: &HeaderMap) -> Option<&str> {
    let direct = headers
        .get("x-admin-token")
        .and_then(|value| value.to_str().ok())
        .map(str::trim);
    direct
        .or_else(|| {
            let auth = headers.get("authorization")?.to_str().ok()?.trim();
            auth.strip_prefix("Bearer ")
                .or_else(|| auth.strip_prefix("bearer "))
                .map(str::trim)
        })
        .filter(|token| !token.is_empty())
}

fn ensure_admin(state: &GatewayHttpState, headers: &HeaderMap) -> Result<(), AdminError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(openai_error(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "not_configured",
            "admin auth not configured",
        ));
    };
    if extract_admin_token(headers) == Some(expected) {
        return Ok(());
    }
    Err(openai_error(
        StatusCode::UNAUTHORIZED,
        "authentication_error",
        "unauthorized",
        "invalid admin token",
    ))
}

async fn list_backends(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Result<Json<Vec<BackendHealthSnapshot>>, AdminError> {
    ensure_admin(&state, &headers)?;
    Ok(Json(state.pipeline.routing().health().snapshot()))
}

fn force_backend(
    state: &GatewayHttpState,
    id: &str,
    status: HealthStatus,
) -> Result<Json<BackendHealthSnapshot>, AdminError> {
    let routing = state.pipeline.routing();
    if !routing.force_health(id, status) {
        return Err(openai_error(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "not_found",
            format!("backend not found: {id}"),
        ));
    }
    routing
        .health()
        .backend_snapshot(id)
        .map(Json)
        .ok_or_else(|| {
            openai_error(
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "not_found",
                format!("backend not found: {id}"),
            )
        })
}

async fn reset_backend(
    State(state): State<GatewayHttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<BackendHealthSnapshot>, AdminError> {
    ensure_admin(&state, &headers)?;
    force_backend(&state, &id, HealthStatus::Healthy)
}

async fn mark_backend_unhealthy(
    State(state): State<GatewayHttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<BackendHealthSnapshot>, AdminError> {
    ensure_admin(&state, &headers)?;
    force_backend(&state, &id, HealthStatus::Unhealthy)
}

async fn list_decisions(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Result<Json<Vec<RoutingDecisionRecord>>, AdminError> {
    ensure_admin(&state, &headers)?;
    Ok(Json(state.pipeline.routing().decisions()))
}

#[derive(Debug, Serialize)]
struct PoliciesResponse {
    generation: u64,
    loaded_at_millis: u64,
    policies: Vec<RoutingPolicy>,
    backends: Vec<String>,
}

async fn list_policies(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Result<Json<PoliciesResponse>, AdminError> {
    ensure_admin(&state, &headers)?;
    let snapshot = state.pipeline.routing().snapshot();
    Ok(Json(PoliciesResponse {
        generation: snapshot.generation,
        loaded_at_millis: snapshot.loaded_at_millis,
        policies: snapshot
            .policies()
            .iter()
            .map(|policy| policy.as_ref().clone())
            .collect(),
        backends: snapshot.backend_ids(),
    }))
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    generation: u64,
}

async fn refresh_policies(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Result<Json<RefreshResponse>, AdminError> {
    ensure_admin(&state, &headers)?;
    let generation = state.pipeline.routing().refresh().await.map_err(|err| {
        openai_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "server_error",
            "refresh_failed",
            err,
        )
    })?;
    Ok(Json(RefreshResponse { generation }))
}

#[derive(Debug, Serialize)]
struct RateLimitResetResponse {
    tenant_id: String,
    limit: u32,
}

async fn reset_rate_limit(
    State(state): State<GatewayHttpState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RateLimitResetResponse>, AdminError> {
    ensure_admin(&state, &headers)?;
    let limiter = state.pipeline.limiter();
    limiter.reset(&tenant).await.map_err(|err| {
        openai_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "server_error",
            "service_unavailable",
            err,
        )
    })?;
    let limit = limiter.profile_for(&tenant).burst;
    Ok(Json(RateLimitResetResponse {
        tenant_id: tenant,
        limit,
    }))
}
