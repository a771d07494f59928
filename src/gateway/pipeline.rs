//! Per-request orchestration:
//! `Received -> Authenticated -> RateChecked -> BudgetChecked -> Routed -> Dispatched -> Accounted -> Completed`.
//!
//! Every stage either advances or ends the request with a typed error tagged with the stage
//! it failed in. One deadline and one cancellation token cover all stages, including the
//! in-flight backend call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use super::auth::{AuthContext, AuthError, AuthResolver, INFERENCE_SCOPE};
use super::budget::{BudgetDecision, BudgetEnforcer};
use super::dispatch::{DispatchBody, Dispatcher, StreamEnd, StreamSummary, UpstreamRequest};
use super::limits::{RateDecision, RateLimiter, RateStatus};
use super::observability::Observability;
use super::routing::{DecisionKind, RoutingDecisionRecord, RoutingEngine, RoutingError};
use super::usage::{UsageEvent, UsageOutcome, UsagePublisher};
use super::{Clock, GatewayError};
use crate::utils::sse::ObservedUsage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Authenticated,
    RateChecked,
    BudgetChecked,
    Routed,
    Dispatched,
    Accounted,
    Completed,
}

/// Terminal `Errored(stage, reason)` state. `stage` is the stage that could not be reached.
#[derive(Debug)]
pub struct PipelineError {
    pub stage: Stage,
    pub error: GatewayError,
    /// Bucket state, once the rate check has run.
    pub rate: Option<RateStatus>,
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.stage, self.error)
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Clone, Debug)]
pub struct InboundRequest {
    pub request_id: String,
    pub credential: Option<String>,
    pub method: reqwest::Method,
    pub path: String,
    pub body: Bytes,
    /// Client-requested bound, capped by the server's request timeout.
    pub timeout: Option<Duration>,
}

pub enum PipelineBody {
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes, std::io::Error>>),
}

pub struct PipelineResponse {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: PipelineBody,
    pub rate: RateStatus,
    pub backend_id: String,
    pub decision: DecisionKind,
    pub attempts: usize,
}

pub struct ModelList {
    pub models: Vec<String>,
    pub rate: RateStatus,
}

struct Admitted {
    context: AuthContext,
    rate: RateStatus,
}

pub struct Pipeline {
    auth: Arc<AuthResolver>,
    limiter: Arc<RateLimiter>,
    budgets: Arc<BudgetEnforcer>,
    routing: Arc<RoutingEngine>,
    dispatcher: Arc<Dispatcher>,
    usage: Arc<UsagePublisher>,
    observability: Arc<Observability>,
    clock: Arc<dyn Clock>,
    max_timeout: Duration,
}

#[derive(Clone)]
pub struct PipelineParts {
    pub auth: Arc<AuthResolver>,
    pub limiter: Arc<RateLimiter>,
    pub budgets: Arc<BudgetEnforcer>,
    pub routing: Arc<RoutingEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub usage: Arc<UsagePublisher>,
    pub observability: Arc<Observability>,
    pub clock: Arc<dyn Clock>,
    pub max_timeout: Duration,
}

impl Pipeline {
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            auth: parts.auth,
            limiter: parts.limiter,
            budgets: parts.budgets,
            routing: parts.routing,
            dispatcher: parts.dispatcher,
            usage: parts.usage,
            observability: parts.observability,
            clock: parts.clock,
            max_timeout: parts.max_timeout,
        }
    }

    pub fn auth(&self) -> &Arc<AuthResolver> {
        &self.auth
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn budgets(&self) -> &Arc<BudgetEnforcer> {
        &self.budgets
    }

    pub fn routing(&self) -> &Arc<RoutingEngine> {
        &self.routing
    }

    pub fn usage(&self) -> &Arc<UsagePublisher> {
        &self.usage
    }

    pub fn observability(&self) -> &Arc<Observability> {
        &self.observability
    }

    fn deadline(&self, requested: Option<Duration>) -> Instant {
        let bound = requested
            .filter(|timeout| !timeout.is_zero())
            .map_or(self.max_timeout, |timeout| timeout.min(self.max_timeout));
        Instant::now() + bound
    }

    /// Runs one stage under the request deadline and the cancellation token.
    async fn guarded<T>(
        &self,
        stage: Stage,
        deadline: Instant,
        cancel: &CancellationToken,
        rate: Option<RateStatus>,
        work: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, PipelineError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(GatewayError::DeadlineExceeded),
            result = work => result,
        };
        result.map_err(|error| self.fail(stage, error, rate))
    }

    fn fail(&self, stage: Stage, error: GatewayError, rate: Option<RateStatus>) -> PipelineError {
        match &error {
            GatewayError::DeadlineExceeded => self.observability.record_deadline_exceeded(),
            GatewayError::Cancelled => self.observability.record_cancelled(),
            _ => self.observability.record_stage_error(stage),
        }
        tracing::debug!(stage = ?stage, error = %error, "request ended in error");
        PipelineError { stage, error, rate }
    }

    async fn admit(
        &self,
        credential: Option<&str>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Admitted, PipelineError> {
        let context = self
            .guarded(Stage::Authenticated, deadline, cancel, None, async {
                let Some(credential) = credential else {
                    return Err(GatewayError::InvalidCredential {
                        reason: AuthError::MissingCredential.to_string(),
                    });
                };
                let context = self.auth.resolve(credential).await.map_err(auth_error)?;
                if !context.has_scope(INFERENCE_SCOPE) {
                    return Err(auth_error(AuthError::MissingScope(INFERENCE_SCOPE.to_string())));
                }
                Ok(context)
            })
            .await?;
        tracing::Span::current().record("tenant", tracing::field::display(&context.tenant_id));

        let decision = self
            .guarded(Stage::RateChecked, deadline, cancel, None, async {
                self.limiter
                    .admit(&context.tenant_id)
                    .await
                    .map_err(|err| GatewayError::DependencyUnavailable {
                        message: err.to_string(),
                    })
            })
            .await?;
        let rate = decision.status();
        if let RateDecision::Deny {
            status,
            retry_after,
        } = decision
        {
            return Err(self.fail(
                Stage::RateChecked,
                GatewayError::RateLimited {
                    limit: status.limit,
                    remaining: status.remaining,
                    retry_after,
                    reset_after: status.reset_after,
                },
                Some(rate),
            ));
        }

        Ok(Admitted { context, rate })
    }

    /// `GET /v1/models`: auth and rate limit, then the models routable for the tenant.
    pub async fn list_models(
        &self,
        credential: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ModelList, PipelineError> {
        self.observability.record_request();
        let deadline = self.deadline(None);
        let admitted = self.admit(credential, deadline, &cancel).await?;
        let models = self
            .routing
            .snapshot()
            .models_for(&admitted.context.tenant_id);
        self.observability.record_completed();
        Ok(ModelList {
            models,
            rate: admitted.rate,
        })
    }

    /// Completion requests: the full admission, routing, dispatch and accounting path.
    pub async fn handle(
        &self,
        request: InboundRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineResponse, PipelineError> {
        let span = tracing::info_span!(
            "request",
            request_id = %request.request_id,
            tenant = tracing::field::Empty,
            model = tracing::field::Empty,
        );
        self.handle_inner(request, cancel).instrument(span).await
    }

    async fn handle_inner(
        &self,
        request: InboundRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineResponse, PipelineError> {
        self.observability.record_request();
        let started = Instant::now();
        let deadline = self.deadline(request.timeout);

        let Admitted { context, rate } = self
            .admit(request.credential.as_deref(), deadline, &cancel)
            .await?;

        let estimated_cost = self.budgets.estimated_cost();
        let budget = self
            .guarded(Stage::BudgetChecked, deadline, &cancel, Some(rate), async {
                self.budgets
                    .check(&context.tenant_id, estimated_cost)
                    .await
                    .map_err(|err| GatewayError::DependencyUnavailable {
                        message: err.to_string(),
                    })
            })
            .await?;
        if let BudgetDecision::Deny {
            limit,
            consumed,
            attempted,
        } = budget
        {
            return Err(self.fail(
                Stage::BudgetChecked,
                GatewayError::BudgetExceeded {
                    limit,
                    consumed,
                    attempted,
                    resets_after: self.budgets.resets_after(&context.tenant_id),
                },
                Some(rate),
            ));
        }

        // The body is only inspected once the caller is admitted.
        let (model, stream) = parse_completion_request(&request.path, &request.body)
            .map_err(|error| self.fail(Stage::Received, error, Some(rate)))?;
        tracing::Span::current().record("model", tracing::field::display(&model));

        let plan = self
            .routing
            .plan(&model, &context.tenant_id)
            .map_err(|err| self.fail(Stage::Routed, routing_error(err), Some(rate)))?;

        let accounting = Accounting {
            budgets: Arc::clone(&self.budgets),
            usage: Arc::clone(&self.usage),
            routing: Arc::clone(&self.routing),
            clock: Arc::clone(&self.clock),
            request_id: request.request_id.clone(),
            tenant_id: context.tenant_id.clone(),
            key_fingerprint: context.key_fingerprint.clone(),
            model: model.clone(),
            policy_key: plan.policy_key.clone(),
            stream,
            started,
        };

        let upstream = UpstreamRequest {
            method: request.method.clone(),
            path: request.path.clone(),
            body: request.body.clone(),
            stream,
            request_id: request.request_id.clone(),
        };
        let dispatched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err((GatewayError::Cancelled, None)),
            _ = tokio::time::sleep_until(deadline) => Err((GatewayError::DeadlineExceeded, None)),
            result = self.dispatcher.dispatch_with_failover(&plan, &upstream, &cancel) => {
                result.map_err(|failure| {
                    let attempts = failure.attempts();
                    let backend = failure.attempted.last().cloned();
                    (failure.into_gateway_error(), Some((backend, attempts)))
                })
            }
        };

        let response = match dispatched {
            Ok(response) => response,
            Err((error, attempted)) => {
                // An interrupted dispatch is charged to the primary as a single attempt.
                let (backend, attempts) = attempted.unwrap_or_else(|| {
                    (plan.primary().map(|candidate| candidate.backend.id.clone()), 1)
                });
                self.observability.record_backend_calls(attempts);
                accounting.failed(backend, attempts, plan.decision, &error);
                return Err(self.fail(Stage::Dispatched, error, Some(rate)));
            }
        };
        self.observability.record_backend_calls(response.attempts);

        let status = response.status;
        let backend_id = response.backend_id.clone();
        let decision = response.decision;
        let attempts = response.attempts;
        let outcome = if response.is_success() {
            UsageOutcome::Success
        } else {
            UsageOutcome::ClientError
        };

        let body = match response.body {
            DispatchBody::Full { bytes, usage } => {
                let record = accounting.record(
                    backend_id.clone(),
                    status,
                    attempts,
                    decision,
                    outcome,
                    usage,
                );
                if self.budgets.config().recheck_after_dispatch {
                    record.finish_now().await;
                } else {
                    record.finish_in_background();
                }
                PipelineBody::Full(bytes)
            }
            DispatchBody::Stream(upstream) => {
                let accounting = accounting.clone();
                let backend = backend_id.clone();
                PipelineBody::Stream(upstream.into_body_stream(move |summary: StreamSummary| {
                    let outcome = match summary.end {
                        StreamEnd::Completed => UsageOutcome::Success,
                        StreamEnd::Truncated | StreamEnd::Error => UsageOutcome::StreamError,
                        StreamEnd::Aborted => UsageOutcome::StreamAborted,
                    };
                    accounting
                        .record(backend, status, attempts, decision, outcome, summary.usage)
                        .finish_in_background();
                }))
            }
        };
        tracing::debug!(stage = ?Stage::Accounted, backend = %backend_id, "accounting handed off");

        self.observability.record_completed();
        Ok(PipelineResponse {
            status,
            headers: response.headers,
            body,
            rate,
            backend_id,
            decision,
            attempts,
        })
    }
}

/// Validates the fields the gateway itself depends on; the rest is the backend's concern.
fn parse_completion_request(path: &str, body: &Bytes) -> Result<(String, bool), GatewayError> {
    let invalid = |reason: &str| GatewayError::InvalidRequest {
        reason: reason.to_string(),
    };
    if body.is_empty() {
        return Err(invalid("request body is empty"));
    }
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|err| GatewayError::InvalidRequest {
            reason: format!("request body is not valid json: {err}"),
        })?;
    let Some(object) = value.as_object() else {
        return Err(invalid("request body must be a json object"));
    };
    let model = object
        .get("model")
        .and_then(|model| model.as_str())
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .ok_or_else(|| invalid("missing field `model`"))?;
    let stream = match object.get("stream") {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(stream)) => *stream,
        Some(_) => return Err(invalid("`stream` must be a boolean")),
    };
    if path.ends_with("/chat/completions") {
        let has_messages = object
            .get("messages")
            .and_then(|messages| messages.as_array())
            .is_some_and(|messages| !messages.is_empty());
        if !has_messages {
            return Err(invalid("`messages` must be a non-empty array"));
        }
    } else if path.ends_with("/completions") && object.get("prompt").is_none_or(|p| p.is_null()) {
        return Err(invalid("missing field `prompt`"));
    }
    Ok((model.to_string(), stream))
}

fn auth_error(err: AuthError) -> GatewayError {
    match err {
        AuthError::DependencyUnavailable(message) => GatewayError::AuthUnavailable { message },
        err @ AuthError::MissingScope(_) => GatewayError::Forbidden {
            reason: err.to_string(),
        },
        other => GatewayError::InvalidCredential {
            reason: other.to_string(),
        },
    }
}

fn routing_error(err: RoutingError) -> GatewayError {
    match err {
        RoutingError::NoPolicy { model } => GatewayError::NoPolicy { model },
        RoutingError::NoHealthyBackend { model } => GatewayError::NoHealthyBackend { model },
        other => GatewayError::DependencyUnavailable {
            message: other.to_string(),
        },
    }
}

/// Request-scoped handles needed to emit the single usage event after dispatch.
#[derive(Clone)]
struct Accounting {
    budgets: Arc<BudgetEnforcer>,
    usage: Arc<UsagePublisher>,
    routing: Arc<RoutingEngine>,
    clock: Arc<dyn Clock>,
    request_id: String,
    tenant_id: String,
    key_fingerprint: String,
    model: String,
    policy_key: String,
    stream: bool,
    started: Instant,
}

struct PendingRecord {
    budgets: Arc<BudgetEnforcer>,
    usage: Arc<UsagePublisher>,
    event: UsageEvent,
    charge: bool,
}

impl Accounting {
    fn event(
        &self,
        backend_id: Option<String>,
        status: Option<u16>,
        attempts: usize,
        decision: DecisionKind,
        outcome: UsageOutcome,
        usage: Option<ObservedUsage>,
    ) -> UsageEvent {
        let usage = usage.unwrap_or_default();
        UsageEvent {
            request_id: self.request_id.clone(),
            tenant_id: self.tenant_id.clone(),
            model: self.model.clone(),
            backend_id,
            input_units: usage.input_units(),
            output_units: usage.output_units(),
            latency_ms: self.started.elapsed().as_millis() as u64,
            outcome,
            status,
            attempts,
            decision: Some(decision.as_str().to_string()),
            stream: self.stream,
            key_fingerprint: Some(self.key_fingerprint.clone()),
            limit_state: None,
            timestamp_ms: self.clock.now_epoch_millis(),
        }
    }

    fn log_decision(&self, event: &UsageEvent, decision: DecisionKind) {
        self.routing.record_decision(RoutingDecisionRecord {
            ts_ms: event.timestamp_ms,
            request_id: self.request_id.clone(),
            tenant_id: self.tenant_id.clone(),
            model: self.model.clone(),
            policy_key: self.policy_key.clone(),
            decision,
            backend: event.backend_id.clone(),
            attempts: event.attempts,
            outcome: event.outcome.as_str().to_string(),
        });
    }

    fn record(
        &self,
        backend_id: String,
        status: u16,
        attempts: usize,
        decision: DecisionKind,
        outcome: UsageOutcome,
        usage: Option<ObservedUsage>,
    ) -> PendingRecord {
        let event = self.event(
            Some(backend_id),
            Some(status),
            attempts,
            decision,
            outcome,
            usage,
        );
        self.log_decision(&event, decision);
        PendingRecord {
            budgets: Arc::clone(&self.budgets),
            usage: Arc::clone(&self.usage),
            charge: outcome == UsageOutcome::Success,
            event,
        }
    }

    fn failed(
        &self,
        backend_id: Option<String>,
        attempts: usize,
        decision: DecisionKind,
        error: &GatewayError,
    ) {
        let outcome = match error {
            GatewayError::Cancelled => UsageOutcome::Cancelled,
            GatewayError::DeadlineExceeded | GatewayError::BackendTimeout { .. } => {
                UsageOutcome::Timeout
            }
            GatewayError::BackendsExhausted { .. } => UsageOutcome::Unavailable,
            _ => UsageOutcome::BackendError,
        };
        let event = self.event(backend_id, None, attempts, decision, outcome, None);
        self.log_decision(&event, decision);
        self.usage.publish(event);
    }
}

impl PendingRecord {
    /// Advances the budget ledger, then publishes with the resulting ledger state.
    async fn finish_now(mut self) {
        if self.charge {
            match self
                .budgets
                .record(
                    &self.event.tenant_id,
                    self.event.input_units,
                    self.event.output_units,
                )
                .await
            {
                Ok(consumed) => self.event.limit_state = consumed,
                Err(err) => {
                    tracing::warn!(tenant = %self.event.tenant_id, error = %err, "budget ledger update failed")
                }
            }
        }
        self.usage.publish(self.event);
    }

    /// Publishes immediately and advances the ledger off the request path.
    fn finish_in_background(self) {
        let PendingRecord {
            budgets,
            usage,
            event,
            charge,
        } = self;
        if charge {
            let tenant = event.tenant_id.clone();
            let (input, output) = (event.input_units, event.output_units);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(err) = budgets.record(&tenant, input, output).await {
                            tracing::warn!(tenant = %tenant, error = %err, "budget ledger update failed");
                        }
                    });
                }
                Err(_) => {
                    tracing::warn!(tenant = %tenant, "no runtime to record budget usage");
                }
            }
        }
        usage.publish(event);
    }
}

/// `req_<32 hex>` from the OS random source, falling back to time and a counter.
pub fn new_request_id() -> String {
    let mut bytes = [0u8; 16];
    if getrandom::fill(&mut bytes).is_err() {
        let a = super::routing::random_roll().to_le_bytes();
        let b = super::routing::random_roll().to_le_bytes();
        bytes[..8].copy_from_slice(&a);
        bytes[8..].copy_from_slice(&b);
    }
    let mut out = String::with_capacity(4 + 32);
    out.push_str("req_");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
