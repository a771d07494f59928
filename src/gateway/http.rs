//! OpenAI-compatible inbound surface plus status and admin endpoints.

mod admin;
mod errors;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::auth::extract_credential;
use super::counter_store::CounterStore;
use super::limits::RateStatus;
use super::observability::ObservabilitySnapshot;
use super::pipeline::{InboundRequest, Pipeline, PipelineBody, new_request_id};
use super::routing::BackendHealthSnapshot;
use super::usage::UsageStats;
use super::GatewayError;

pub use errors::{OpenAiErrorDetail, OpenAiErrorResponse};

const REQUEST_ID_HEADER: &str = "x-request-id";
const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout-ms";
const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Clone)]
pub struct GatewayHttpState {
    pipeline: Arc<Pipeline>,
    counter_store: Arc<dyn CounterStore>,
    admin_token: Option<String>,
    max_body_bytes: usize,
}

impl GatewayHttpState {
    pub fn new(pipeline: Arc<Pipeline>, counter_store: Arc<dyn CounterStore>) -> Self {
        Self {
            pipeline,
            counter_store,
            admin_token: None,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|token| !token.trim().is_empty());
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes.max(1);
        self
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    fn budget_denial_status(&self) -> StatusCode {
        StatusCode::from_u16(self.pipeline.budgets().config().denial_status)
            .unwrap_or(StatusCode::PAYMENT_REQUIRED)
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    let mut router = Router::new()
        .route("/v1/chat/completions", post(handle_completion))
        .route("/v1/completions", post(handle_completion))
        .route("/v1/models", get(list_models))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics));

    if state.admin_token.is_some() {
        router = router.merge(admin::router());
    }

    let max_body_bytes = state.max_body_bytes;
    router
        .fallback(handle_fallback)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .filter(|id| id.bytes().all(|b| b.is_ascii_graphic()))
        .map(str::to_string)
        .unwrap_or_else(new_request_id)
}

fn requested_timeout(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(REQUEST_TIMEOUT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|millis| *millis > 0)
        .map(Duration::from_millis)
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Whole seconds, rounded up so a sub-second wait never reads as zero.
fn ceil_seconds(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

fn apply_rate_headers(headers: &mut HeaderMap, rate: &RateStatus) {
    insert_header(headers, "x-ratelimit-limit", rate.limit);
    insert_header(headers, "x-ratelimit-remaining", rate.remaining);
    insert_header(headers, "x-ratelimit-reset", ceil_seconds(rate.reset_after));
}

// Hop-by-hop and framing headers are owned by this connection, not the upstream one.
fn is_passthrough_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

async fn handle_completion(
    State(state): State<GatewayHttpState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id_from(&headers);
    let request = InboundRequest {
        request_id: request_id.clone(),
        credential: extract_credential(&headers).map(str::to_string),
        method: method.clone(),
        path: uri.path().to_string(),
        body,
        timeout: requested_timeout(&headers),
    };

    // The pipeline runs on its own task so a client disconnect surfaces as cancellation
    // and the request is still accounted.
    let cancel = CancellationToken::new();
    let disconnect = cancel.clone().drop_guard();
    let pipeline = Arc::clone(&state.pipeline);
    let task = tokio::spawn(async move { pipeline.handle(request, cancel).await });
    let joined = task.await;
    disconnect.disarm();

    let result = match joined {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(request_id = %request_id, error = %err, "request task failed");
            let error = GatewayError::DependencyUnavailable {
                message: "request task failed".to_string(),
            };
            return errors::error_response(&error, None, state.budget_denial_status(), &request_id);
        }
    };

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            return errors::error_response(
                &err.error,
                err.rate.as_ref(),
                state.budget_denial_status(),
                &request_id,
            );
        }
    };

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers.iter() {
        if is_passthrough_header(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    apply_rate_headers(&mut headers, &response.rate);
    insert_header(&mut headers, "x-routing-backend", &response.backend_id);
    insert_header(&mut headers, "x-routing-decision", response.decision.as_str());
    insert_header(&mut headers, REQUEST_ID_HEADER, &request_id);

    let body = match response.body {
        PipelineBody::Full(bytes) => Body::from(bytes),
        PipelineBody::Stream(stream) => Body::from_stream(stream),
    };
    (status, headers, body).into_response()
}

#[derive(Debug, Serialize)]
struct ModelObject {
    id: String,
    object: &'static str,
    created: u64,
    owned_by: &'static str,
}

#[derive(Debug, Serialize)]
struct ModelListResponse {
    object: &'static str,
    data: Vec<ModelObject>,
}

async fn list_models(State(state): State<GatewayHttpState>, headers: HeaderMap) -> Response {
    let request_id = request_id_from(&headers);
    let credential = extract_credential(&headers);
    let cancel = CancellationToken::new();
    let listed = match state.pipeline.list_models(credential, cancel).await {
        Ok(listed) => listed,
        Err(err) => {
            return errors::error_response(
                &err.error,
                err.rate.as_ref(),
                state.budget_denial_status(),
                &request_id,
            );
        }
    };

    let created = state.pipeline.routing().snapshot().loaded_at_millis / 1000;
    let body = ModelListResponse {
        object: "list",
        data: listed
            .models
            .into_iter()
            .map(|id| ModelObject {
                id,
                object: "model",
                created,
                owned_by: "ditto-router",
            })
            .collect(),
    };
    let mut headers = HeaderMap::new();
    apply_rate_headers(&mut headers, &listed.rate);
    insert_header(&mut headers, REQUEST_ID_HEADER, &request_id);
    (StatusCode::OK, headers, Json(body)).into_response()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
    policy_generation: u64,
    counter_store: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn readyz(State(state): State<GatewayHttpState>) -> (StatusCode, Json<ReadyResponse>) {
    let policy_generation = state.pipeline.routing().snapshot().generation;
    let ping = state.counter_store.ping().await;
    let ready = policy_generation > 0 && ping.is_ok();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: if ready { "ready" } else { "not_ready" },
            policy_generation,
            counter_store: if ping.is_ok() { "ok" } else { "unreachable" },
            error: ping.err().map(|err| err.to_string()),
        }),
    )
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    requests: ObservabilitySnapshot,
    usage: UsageStats,
    backends: Vec<BackendHealthSnapshot>,
    policy_generation: u64,
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<MetricsResponse> {
    let pipeline = &state.pipeline;
    Json(MetricsResponse {
        requests: pipeline.observability().snapshot(),
        usage: pipeline.usage().stats(),
        backends: pipeline.routing().health().snapshot(),
        policy_generation: pipeline.routing().snapshot().generation,
    })
}

async fn handle_fallback(uri: Uri) -> Response {
    errors::openai_error(
        StatusCode::NOT_FOUND,
        "invalid_request_error",
        "not_found",
        format!("unknown route {}", uri.path()),
    )
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_seconds_never_rounds_a_partial_second_down() {
        assert_eq!(ceil_seconds(Duration::from_millis(1)), 1);
        assert_eq!(ceil_seconds(Duration::from_millis(1000)), 1);
        assert_eq!(ceil_seconds(Duration::from_millis(1001)), 2);
        assert_eq!(ceil_seconds(Duration::ZERO), 0);
        assert_eq!(ceil_seconds(Duration::MAX), u64::MAX);
    }

    #[test]
    fn request_id_is_honored_only_when_well_formed() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        assert_eq!(request_id_from(&headers), "abc-123");

        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("has space"));
        assert!(request_id_from(&headers).starts_with("req_"));

        let long = "x".repeat(MAX_REQUEST_ID_LEN + 1);
        headers.insert(
            REQUEST_ID_HEADER,
            HeaderValue::from_str(&long).expect("header"),
        );
        assert!(request_id_from(&headers).starts_with("req_"));
    }

    #[test]
    fn hop_by_hop_headers_are_not_forwarded() {
        assert!(!is_passthrough_header(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_passthrough_header(&HeaderName::from_static("content-length")));
        assert!(is_passthrough_header(&HeaderName::from_static("content-type")));
        assert!(is_passthrough_header(&HeaderName::from_static("openai-processing-ms")));
    }

    #[test]
    fn zero_timeout_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_TIMEOUT_HEADER, HeaderValue::from_static("0"));
        assert_eq!(requested_timeout(&headers), None);
        headers.insert(REQUEST_TIMEOUT_HEADER, HeaderValue::from_static("1500"));
        assert_eq!(requested_timeout(&headers), Some(Duration::from_millis(1500)));
    }
}
