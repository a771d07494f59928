use std::time::Duration;

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use super::{REQUEST_ID_HEADER, apply_rate_headers, ceil_seconds, insert_header};
use crate::gateway::GatewayError;
use crate::gateway::limits::RateStatus;

// Lifetime budgets never roll over; clients are told to come back a day later.
const LIFETIME_BUDGET_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAiErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiErrorDetail,
}

pub(super) fn openai_error(
    status: StatusCode,
    kind: &'static str,
    code: &'static str,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<OpenAiErrorResponse>) {
    (
        status,
        Json(OpenAiErrorResponse {
            error: OpenAiErrorDetail {
                message: message.to_string(),
                kind: kind.to_string(),
                code: code.to_string(),
            },
        }),
    )
}

/// Status, OpenAI error `type` and error `code` for a gateway error.
fn classify(error: &GatewayError, budget_status: StatusCode) -> (StatusCode, &'static str, &'static str) {
    match error {
        GatewayError::InvalidCredential { .. } => (
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "invalid_api_key",
        ),
        GatewayError::AuthUnavailable { .. } => (
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "auth_unavailable",
        ),
        GatewayError::Forbidden { .. } => (
            StatusCode::FORBIDDEN,
            "permission_error",
            "insufficient_scope",
        ),
        GatewayError::RateLimited { .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "rate_limit_exceeded",
        ),
        GatewayError::BudgetExceeded { .. } => (budget_status, "insufficient_quota", "budget_exceeded"),
        GatewayError::NoPolicy { .. }
        | GatewayError::NoHealthyBackend { .. }
        | GatewayError::BackendsExhausted { .. }
        | GatewayError::DependencyUnavailable { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "server_error",
            "service_unavailable",
        ),
        GatewayError::BackendTimeout { .. } => (
            StatusCode::GATEWAY_TIMEOUT,
            "server_error",
            "backend_timeout",
        ),
        GatewayError::Backend { .. } => (StatusCode::BAD_GATEWAY, "server_error", "backend_error"),
        GatewayError::InvalidRequest { .. } => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "invalid_request",
        ),
        GatewayError::DeadlineExceeded => (
            StatusCode::GATEWAY_TIMEOUT,
            "server_error",
            "deadline_exceeded",
        ),
        // Nobody reads this one; the status mirrors the common proxy convention.
        GatewayError::Cancelled => (
            StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            "invalid_request_error",
            "request_cancelled",
        ),
    }
}

pub(super) fn error_response(
    error: &GatewayError,
    rate: Option<&RateStatus>,
    budget_status: StatusCode,
    request_id: &str,
) -> Response {
    let (status, kind, code) = classify(error, budget_status);
    let mut headers = HeaderMap::new();

    match error {
        GatewayError::RateLimited {
            limit,
            remaining,
            retry_after,
            reset_after,
        } => {
            apply_rate_headers(
                &mut headers,
                &RateStatus {
                    limit: *limit,
                    remaining: *remaining,
                    reset_after: *reset_after,
                },
            );
            insert_header(&mut headers, "retry-after", ceil_seconds(*retry_after).max(1));
        }
        GatewayError::BudgetExceeded { resets_after, .. } => {
            if let Some(rate) = rate {
                apply_rate_headers(&mut headers, rate);
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = resets_after.unwrap_or(LIFETIME_BUDGET_RETRY_AFTER);
                insert_header(&mut headers, "retry-after", ceil_seconds(wait).max(1));
            }
        }
        _ => {
            if let Some(rate) = rate {
                apply_rate_headers(&mut headers, rate);
            }
        }
    }
    insert_header(&mut headers, REQUEST_ID_HEADER, request_id);

    let (status, body) = openai_error(status, kind, code, error);
    (status, headers, body).into_response()
}
