//! Outbound calls to backends: one attempt per candidate with its own timeout window,
//! bounded failover across the routing plan, and streaming passthrough guarded by
//! time-to-first-byte and inter-chunk idle timeouts instead of a total deadline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::GatewayError;
use super::config::BackendConfig;
use super::routing::{DecisionKind, RoutePlan, RoutingEngine};
use crate::utils::sse::{ObservedUsage, SseUsageTracker, extract_usage_from_slice};

const ERROR_BODY_SNIPPET_BYTES: usize = 512;

#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub method: reqwest::Method,
    /// Path relative to the backend base url, e.g. `/v1/chat/completions`.
    pub path: String,
    pub body: Bytes,
    pub stream: bool,
    pub request_id: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("backend {backend} timed out waiting for {phase}")]
    Timeout { backend: String, phase: &'static str },
    #[error("backend {backend} connection failed: {message}")]
    Connect { backend: String, message: String },
    #[error("backend {backend} returned {status}")]
    Status {
        backend: String,
        status: u16,
        body: String,
    },
    #[error("backend {backend} stream failed: {message}")]
    Stream { backend: String, message: String },
    #[error("backend {backend} request failed: {message}")]
    Request { backend: String, message: String },
    #[error("request cancelled")]
    Cancelled,
}

impl DispatchError {
    pub fn backend(&self) -> Option<&str> {
        match self {
            DispatchError::Timeout { backend, .. }
            | DispatchError::Connect { backend, .. }
            | DispatchError::Status { backend, .. }
            | DispatchError::Stream { backend, .. }
            | DispatchError::Request { backend, .. } => Some(backend),
            DispatchError::Cancelled => None,
        }
    }

    /// Whether another candidate may be tried.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Status { status, .. } => is_retryable_status(*status),
            DispatchError::Cancelled => false,
            _ => true,
        }
    }

    /// Network errors, timeouts and 5xx count against backend health; 408/429 do not.
    pub fn counts_against_health(&self) -> bool {
        match self {
            DispatchError::Status { status, .. } => *status >= 500,
            DispatchError::Cancelled => false,
            _ => true,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Timeout { .. })
    }

    fn from_reqwest(backend: &str, err: reqwest::Error) -> Self {
        let backend = backend.to_string();
        if err.is_timeout() {
            DispatchError::Timeout {
                backend,
                phase: "response",
            }
        } else if err.is_connect() {
            DispatchError::Connect {
                backend,
                message: err.to_string(),
            }
        } else {
            DispatchError::Request {
                backend,
                message: err.to_string(),
            }
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

/// All candidates failed (or the request was cancelled mid-failover).
#[derive(Clone, Debug)]
pub struct DispatchFailure {
    pub attempted: Vec<String>,
    pub last_error: DispatchError,
}

impl DispatchFailure {
    pub fn attempts(&self) -> usize {
        self.attempted.len()
    }

    /// One attempt surfaces as 502/504; exhausted failover as 503.
    pub fn into_gateway_error(self) -> GatewayError {
        match self.last_error {
            DispatchError::Cancelled => GatewayError::Cancelled,
            err if self.attempted.len() > 1 => GatewayError::BackendsExhausted {
                attempts: self.attempted.len(),
                last_error: err.to_string(),
            },
            DispatchError::Timeout { backend, .. } => GatewayError::BackendTimeout { backend },
            err => GatewayError::Backend {
                backend: err.backend().unwrap_or_default().to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    /// Upstream closed an SSE body without the `[DONE]` marker.
    Truncated,
    Error,
    /// The client went away before the stream finished.
    Aborted,
}

#[derive(Clone, Debug)]
pub struct StreamSummary {
    pub end: StreamEnd,
    pub usage: Option<ObservedUsage>,
    pub bytes_sent: u64,
    pub error: Option<String>,
}

pub enum DispatchBody {
    Full {
        bytes: Bytes,
        usage: Option<ObservedUsage>,
    },
    Stream(UpstreamStream),
}

impl std::fmt::Debug for DispatchBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchBody::Full { bytes, usage } => f
                .debug_struct("Full")
                .field("len", &bytes.len())
                .field("usage", usage)
                .finish(),
            DispatchBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// A streaming body whose first chunk has already arrived.
pub struct UpstreamStream {
    routing: Arc<RoutingEngine>,
    backend_id: String,
    first: Bytes,
    rest: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    idle_timeout: Duration,
    is_sse: bool,
}

#[derive(Debug)]
pub struct DispatchResponse {
    pub backend_id: String,
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: DispatchBody,
    pub attempts: usize,
    pub decision: DecisionKind,
}

impl DispatchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

type OnStreamEnd = Box<dyn FnOnce(StreamSummary) + Send>;

struct StreamFinalizer {
    routing: Arc<RoutingEngine>,
    backend_id: String,
    on_end: OnStreamEnd,
}

impl StreamFinalizer {
    fn finish(self, summary: StreamSummary) {
        match summary.end {
            StreamEnd::Completed => {}
            StreamEnd::Truncated | StreamEnd::Error => {
                self.routing
                    .report(&self.backend_id, false, summary.error.clone());
                tracing::warn!(backend = %self.backend_id, end = ?summary.end, error = ?summary.error, "upstream stream ended abnormally");
            }
            StreamEnd::Aborted => {
                tracing::debug!(backend = %self.backend_id, bytes_sent = summary.bytes_sent, "client disconnected mid-stream");
            }
        }
        (self.on_end)(summary);
    }
}

struct StreamState {
    pending_first: Option<Bytes>,
    upstream: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    idle_timeout: Duration,
    is_sse: bool,
    tracker: SseUsageTracker,
    bytes_sent: u64,
    finalizer: Option<StreamFinalizer>,
}

impl StreamState {
    fn finalize(&mut self, end: StreamEnd, error: Option<String>) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        finalizer.finish(StreamSummary {
            end,
            usage: self.tracker.observed_usage(),
            bytes_sent: self.bytes_sent,
            error,
        });
    }

    fn emit(&mut self, chunk: Bytes) -> Bytes {
        self.bytes_sent = self.bytes_sent.saturating_add(chunk.len() as u64);
        self.tracker.ingest(&chunk);
        chunk
    }
}

impl Drop for StreamState {
    fn drop(&mut self) {
        self.finalize(StreamEnd::Aborted, None);
    }
}

impl UpstreamStream {
    /// Turns the upstream body into a passthrough stream. `on_end` runs exactly once when
    /// the stream completes, fails, or is dropped by the client.
    pub fn into_body_stream(
        self,
        on_end: impl FnOnce(StreamSummary) + Send + 'static,
    ) -> BoxStream<'static, Result<Bytes, std::io::Error>> {
        let state = StreamState {
            pending_first: Some(self.first),
            upstream: self.rest,
            idle_timeout: self.idle_timeout,
            is_sse: self.is_sse,
            tracker: SseUsageTracker::default(),
            bytes_sent: 0,
            finalizer: Some(StreamFinalizer {
                routing: self.routing,
                backend_id: self.backend_id,
                on_end: Box::new(on_end),
            }),
        };

        futures_util::stream::try_unfold(state, |mut state| async move {
            if let Some(first) = state.pending_first.take() {
                let chunk = state.emit(first);
                return Ok(Some((chunk, state)));
            }
            match tokio::time::timeout(state.idle_timeout, state.upstream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    let chunk = state.emit(chunk);
                    Ok(Some((chunk, state)))
                }
                Ok(Some(Err(err))) => {
                    let message = err.to_string();
                    state.finalize(StreamEnd::Error, Some(message.clone()));
                    Err(std::io::Error::other(message))
                }
                Ok(None) => {
                    let end = if !state.is_sse || state.tracker.saw_done() {
                        StreamEnd::Completed
                    } else {
                        StreamEnd::Truncated
                    };
                    let error = (end == StreamEnd::Truncated)
                        .then(|| "stream ended without [DONE]".to_string());
                    state.finalize(end, error);
                    Ok(None)
                }
                Err(_) => {
                    let message = format!(
                        "no data for {}ms",
                        state.idle_timeout.as_millis()
                    );
                    state.finalize(StreamEnd::Error, Some(message.clone()));
                    Err(std::io::Error::new(std::io::ErrorKind::TimedOut, message))
                }
            }
        })
        .boxed()
    }
}

pub struct Dispatcher {
    routing: Arc<RoutingEngine>,
    clients: Mutex<HashMap<u64, reqwest::Client>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(routing: Arc<RoutingEngine>) -> Self {
        Self {
            routing,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn routing(&self) -> &Arc<RoutingEngine> {
        &self.routing
    }

    /// One pooled client per connect timeout; per-attempt bounds are applied around calls.
    fn client_for(&self, backend: &BackendConfig) -> Result<reqwest::Client, DispatchError> {
        let connect_timeout_ms = backend.connect_timeout_ms.max(1);
        let mut clients = match self.clients.lock() {
            Ok(clients) => clients,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(client) = clients.get(&connect_timeout_ms) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(connect_timeout_ms))
            .build()
            .map_err(|err| DispatchError::Request {
                backend: backend.id.clone(),
                message: err.to_string(),
            })?;
        clients.insert(connect_timeout_ms, client.clone());
        Ok(client)
    }

    /// A single attempt against one backend. Non-2xx statuses come back as a response
    /// unless they are retryable, in which case they are an error.
    pub async fn dispatch(
        &self,
        backend: &BackendConfig,
        request: &UpstreamRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        let client = self.client_for(backend)?;
        let builder = backend
            .apply_headers(client.request(request.method.clone(), backend.url(&request.path)))
            .header("x-request-id", request.request_id.as_str());
        let builder = if request.body.is_empty() {
            builder
        } else {
            builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(request.body.clone())
        };

        if request.stream {
            self.dispatch_streaming(backend, builder).await
        } else {
            self.dispatch_buffered(backend, builder).await
        }
    }

    async fn dispatch_buffered(
        &self,
        backend: &BackendConfig,
        builder: reqwest::RequestBuilder,
    ) -> Result<DispatchResponse, DispatchError> {
        let timeout = backend.timeout();
        let call = async {
            let response = builder
                .send()
                .await
                .map_err(|err| DispatchError::from_reqwest(&backend.id, err))?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let bytes = response
                .bytes()
                .await
                .map_err(|err| DispatchError::from_reqwest(&backend.id, err))?;
            Ok::<_, DispatchError>((status, headers, bytes))
        };
        let (status, headers, bytes) = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DispatchError::Timeout {
                    backend: backend.id.clone(),
                    phase: "response",
                });
            }
        };

        if is_retryable_status(status) {
            return Err(status_error(&backend.id, status, &bytes));
        }
        let usage = if (200..300).contains(&status) {
            extract_usage_from_slice(&bytes)
        } else {
            None
        };
        Ok(DispatchResponse {
            backend_id: backend.id.clone(),
            status,
            headers,
            body: DispatchBody::Full { bytes, usage },
            attempts: 1,
            decision: DecisionKind::Primary,
        })
    }

    async fn dispatch_streaming(
        &self,
        backend: &BackendConfig,
        builder: reqwest::RequestBuilder,
    ) -> Result<DispatchResponse, DispatchError> {
        let first_byte_timeout = backend.first_byte_timeout();
        let call = async {
            let response = builder
                .send()
                .await
                .map_err(|err| DispatchError::from_reqwest(&backend.id, err))?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            if !(200..300).contains(&status) {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|err| DispatchError::from_reqwest(&backend.id, err))?;
                return Ok::<_, DispatchError>((status, headers, Err(bytes)));
            }
            let mut body = response.bytes_stream().boxed();
            loop {
                match body.next().await {
                    Some(Ok(chunk)) if chunk.is_empty() => continue,
                    Some(Ok(chunk)) => return Ok((status, headers, Ok((chunk, body)))),
                    Some(Err(err)) => {
                        return Err(DispatchError::Stream {
                            backend: backend.id.clone(),
                            message: err.to_string(),
                        });
                    }
                    None => {
                        return Err(DispatchError::Stream {
                            backend: backend.id.clone(),
                            message: "stream closed before first chunk".to_string(),
                        });
                    }
                }
            }
        };

        let (status, headers, body) = match tokio::time::timeout(first_byte_timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DispatchError::Timeout {
                    backend: backend.id.clone(),
                    phase: "first byte",
                });
            }
        };

        let (first, rest) = match body {
            Ok(parts) => parts,
            Err(bytes) => {
                if is_retryable_status(status) {
                    return Err(status_error(&backend.id, status, &bytes));
                }
                return Ok(DispatchResponse {
                    backend_id: backend.id.clone(),
                    status,
                    headers,
                    body: DispatchBody::Full { bytes, usage: None },
                    attempts: 1,
                    decision: DecisionKind::Primary,
                });
            }
        };

        let is_sse = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        Ok(DispatchResponse {
            backend_id: backend.id.clone(),
            status,
            headers,
            body: DispatchBody::Stream(UpstreamStream {
                routing: Arc::clone(&self.routing),
                backend_id: backend.id.clone(),
                first,
                rest,
                idle_timeout: backend.idle_timeout(),
                is_sse,
            }),
            attempts: 1,
            decision: DecisionKind::Primary,
        })
    }

    /// Tries the plan's candidates in order, each with a fresh timeout window, until one
    /// answers or a non-retryable outcome is reached. Every failure is reported to the
    /// health table before moving on.
    pub async fn dispatch_with_failover(
        &self,
        plan: &RoutePlan,
        request: &UpstreamRequest,
        cancel: &CancellationToken,
    ) -> Result<DispatchResponse, DispatchFailure> {
        let mut attempted: Vec<String> = Vec::with_capacity(plan.candidates.len());
        let mut last_error = DispatchError::Request {
            backend: String::new(),
            message: "no candidates".to_string(),
        };

        for (idx, candidate) in plan.candidates.iter().enumerate() {
            let backend = &candidate.backend;
            attempted.push(backend.id.clone());

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DispatchError::Cancelled),
                outcome = self.dispatch(backend, request) => outcome,
            };

            match outcome {
                Ok(mut response) => {
                    if response.is_success() {
                        self.routing.report(&backend.id, true, None);
                    }
                    response.attempts = idx + 1;
                    response.decision = if idx == 0 {
                        plan.decision
                    } else {
                        DecisionKind::Failover
                    };
                    if idx > 0 {
                        tracing::info!(
                            request_id = %request.request_id,
                            backend = %backend.id,
                            attempts = idx + 1,
                            "served after failover"
                        );
                    }
                    return Ok(response);
                }
                Err(DispatchError::Cancelled) => {
                    return Err(DispatchFailure {
                        attempted,
                        last_error: DispatchError::Cancelled,
                    });
                }
                Err(err) => {
                    if err.counts_against_health() {
                        self.routing.report(&backend.id, false, Some(err.to_string()));
                    }
                    tracing::warn!(
                        request_id = %request.request_id,
                        backend = %backend.id,
                        attempt = idx + 1,
                        error = %err,
                        "backend attempt failed"
                    );
                    let retryable = err.is_retryable();
                    last_error = err;
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(DispatchFailure {
            attempted,
            last_error,
        })
    }
}

fn status_error(backend: &str, status: u16, body: &Bytes) -> DispatchError {
    let take = body.len().min(ERROR_BODY_SNIPPET_BYTES);
    DispatchError::Status {
        backend: backend.to_string(),
        status,
        body: String::from_utf8_lossy(&body[..take]).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_and_health_classification() {
        let status = |status| DispatchError::Status {
            backend: "x".to_string(),
            status,
            body: String::new(),
        };
        assert!(status(503).is_retryable());
        assert!(status(503).counts_against_health());
        assert!(status(429).is_retryable());
        assert!(!status(429).counts_against_health());
        assert!(!status(400).is_retryable());

        let timeout = DispatchError::Timeout {
            backend: "x".to_string(),
            phase: "first byte",
        };
        assert!(timeout.is_retryable());
        assert!(timeout.counts_against_health());
        assert!(!DispatchError::Cancelled.is_retryable());
    }

    #[test]
    fn failure_maps_to_gateway_error_by_attempt_count() {
        let timeout = DispatchError::Timeout {
            backend: "x".to_string(),
            phase: "response",
        };
        let single = DispatchFailure {
            attempted: vec!["x".to_string()],
            last_error: timeout.clone(),
        };
        assert!(matches!(
            single.into_gateway_error(),
            GatewayError::BackendTimeout { backend } if backend == "x"
        ));

        let connect = DispatchFailure {
            attempted: vec!["x".to_string()],
            last_error: DispatchError::Connect {
                backend: "x".to_string(),
                message: "refused".to_string(),
            },
        };
        assert!(matches!(connect.into_gateway_error(), GatewayError::Backend { .. }));

        let exhausted = DispatchFailure {
            attempted: vec!["x".to_string(), "y".to_string()],
            last_error: timeout,
        };
        assert!(matches!(
            exhausted.into_gateway_error(),
            GatewayError::BackendsExhausted { attempts: 2, .. }
        ));
    }
}
