//! Fire-and-forget usage accounting.
//!
//! `publish` only touches an in-memory bounded queue. A single background worker drains it in
//! batches, retries failed sends with capped exponential backoff, and counts what it has to
//! drop. Delivery is at-least-once with possible loss; consumers dedupe on `request_id`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Success,
    /// The backend answered with a client error that was passed through.
    ClientError,
    BackendError,
    Timeout,
    Unavailable,
    StreamError,
    StreamAborted,
    Cancelled,
}

impl UsageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageOutcome::Success => "success",
            UsageOutcome::ClientError => "client_error",
            UsageOutcome::BackendError => "backend_error",
            UsageOutcome::Timeout => "timeout",
            UsageOutcome::Unavailable => "unavailable",
            UsageOutcome::StreamError => "stream_error",
            UsageOutcome::StreamAborted => "stream_aborted",
            UsageOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub request_id: String,
    pub tenant_id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    pub input_units: u64,
    pub output_units: u64,
    pub latency_ms: u64,
    pub outcome: UsageOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub attempts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_fingerprint: Option<String>,
    /// Budget ledger value after this event, when it was recorded synchronously.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_state: Option<u64>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Error)]
pub enum UsageSinkError {
    #[error("usage sink request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("usage sink rejected batch with status {0}")]
    Rejected(u16),
    #[error("usage sink timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn send(&self, events: &[UsageEvent]) -> Result<(), UsageSinkError>;

    fn describe(&self) -> String;
}

/// POSTs batches as a json array to the ingestion endpoint.
pub struct HttpUsageSink {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpUsageSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

#[async_trait]
impl UsageSink for HttpUsageSink {
    async fn send(&self, events: &[UsageEvent]) -> Result<(), UsageSinkError> {
        let mut request = self.client.post(&self.url).json(events);
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(UsageSinkError::Rejected(status.as_u16()))
        }
    }

    fn describe(&self) -> String {
        format!("http:{}", self.url)
    }
}

/// Writes each event as a structured log line under the `usage` target.
#[derive(Debug, Default)]
pub struct LogUsageSink;

#[async_trait]
impl UsageSink for LogUsageSink {
    async fn send(&self, events: &[UsageEvent]) -> Result<(), UsageSinkError> {
        for event in events {
            let payload = serde_json::to_string(event)
                .map_err(|err| UsageSinkError::Other(err.to_string()))?;
            tracing::info!(target: "usage", request_id = %event.request_id, tenant = %event.tenant_id, event = %payload, "usage");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "log".to_string()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued event to make room for the new one.
    #[default]
    DropOldest,
    DropNewest,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsageSinkConfig {
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[default]
    Log,
}

impl std::fmt::Debug for UsageSinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsageSinkConfig::Http { url, token } => f
                .debug_struct("Http")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "<redacted>"))
                .finish(),
            UsageSinkConfig::Log => f.write_str("Log"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageConfig {
    #[serde(default)]
    pub sink: UsageSinkConfig,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub drop_policy: DropPolicy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Bound on one send attempt.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Retries after the first failed attempt before a batch is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_send_timeout_ms() -> u64 {
    2_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            sink: UsageSinkConfig::default(),
            queue_capacity: default_queue_capacity(),
            drop_policy: DropPolicy::default(),
            batch_size: default_batch_size(),
            send_timeout_ms: default_send_timeout_ms(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl UsageConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("usage.queue_capacity must be >= 1".to_string());
        }
        if self.batch_size == 0 {
            return Err("usage.batch_size must be >= 1".to_string());
        }
        if let UsageSinkConfig::Http { url, .. } = &self.sink {
            if url.trim().is_empty() {
                return Err("usage.sink.url must not be empty".to_string());
            }
        }
        Ok(())
    }

    pub fn build_sink(&self) -> Result<Arc<dyn UsageSink>, reqwest::Error> {
        Ok(match &self.sink {
            UsageSinkConfig::Http { url, token } => Arc::new(
                HttpUsageSink::new(url.clone(), Duration::from_millis(self.send_timeout_ms.max(1)))?
                    .with_token(token.clone()),
            ),
            UsageSinkConfig::Log => Arc::new(LogUsageSink),
        })
    }

    fn backoff(&self, retry: u32) -> Duration {
        let base = self.initial_backoff_ms.max(1);
        let factor = 1u64.checked_shl(retry.min(20)).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(self.max_backoff_ms.max(base)))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub published: u64,
    pub delivered: u64,
    pub retries: u64,
    /// Evicted or rejected because the queue was full.
    pub dropped_overflow: u64,
    /// Given up on after exhausting retries.
    pub dropped_failed: u64,
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    retries: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_failed: AtomicU64,
}

struct Shared {
    config: UsageConfig,
    sink: Arc<dyn UsageSink>,
    queue: Mutex<VecDeque<UsageEvent>>,
    wake: Notify,
    closed: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<UsageEvent>> {
        match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn next_batch(&self) -> Vec<UsageEvent> {
        let mut queue = self.lock_queue();
        let n = queue.len().min(self.config.batch_size.max(1));
        queue.drain(..n).collect()
    }

    async fn deliver(&self, batch: Vec<UsageEvent>) {
        let timeout = Duration::from_millis(self.config.send_timeout_ms.max(1));
        let count = batch.len() as u64;
        let mut retry = 0u32;
        loop {
            let result = match tokio::time::timeout(timeout, self.sink.send(&batch)).await {
                Ok(result) => result,
                Err(_) => Err(UsageSinkError::Timeout(timeout)),
            };
            match result {
                Ok(()) => {
                    self.counters.delivered.fetch_add(count, Ordering::Relaxed);
                    return;
                }
                Err(err) if retry < self.config.max_retries => {
                    let backoff = self.config.backoff(retry);
                    tracing::debug!(sink = %self.sink.describe(), error = %err, retry, backoff_ms = backoff.as_millis() as u64, "usage send failed, retrying");
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    retry += 1;
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    self.counters
                        .dropped_failed
                        .fetch_add(count, Ordering::Relaxed);
                    tracing::error!(sink = %self.sink.describe(), error = %err, dropped = count, "usage events dropped after retries");
                    return;
                }
            }
        }
    }
}

pub struct UsagePublisher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UsagePublisher {
    /// Starts the background worker. Must be called inside a tokio runtime.
    pub fn start(config: UsageConfig, sink: Arc<dyn UsageSink>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity.min(1024))),
            config,
            sink,
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = tokio::spawn(async move {
            loop {
                let batch = worker_shared.next_batch();
                if batch.is_empty() {
                    if worker_shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    worker_shared.wake.notified().await;
                    continue;
                }
                worker_shared.deliver(batch).await;
            }
        });

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues without waiting. Never fails the caller; overflow is counted and logged.
    pub fn publish(&self, event: UsageEvent) {
        if self.shared.closed.load(Ordering::SeqCst) {
            self.shared
                .counters
                .dropped_overflow
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(request_id = %event.request_id, "usage publisher closed, event dropped");
            return;
        }

        let dropped = {
            let mut queue = self.shared.lock_queue();
            if queue.len() >= self.shared.config.queue_capacity {
                match self.shared.config.drop_policy {
                    DropPolicy::DropOldest => {
                        let evicted = queue.pop_front();
                        queue.push_back(event);
                        evicted
                    }
                    DropPolicy::DropNewest => Some(event),
                }
            } else {
                queue.push_back(event);
                None
            }
        };

        if let Some(dropped) = dropped {
            self.shared
                .counters
                .dropped_overflow
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(request_id = %dropped.request_id, policy = ?self.shared.config.drop_policy, "usage queue full, event dropped");
        }
        self.shared
            .counters
            .published
            .fetch_add(1, Ordering::Relaxed);
        self.shared.wake.notify_one();
    }

    pub fn stats(&self) -> UsageStats {
        let counters = &self.shared.counters;
        UsageStats {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            dropped_overflow: counters.dropped_overflow.load(Ordering::Relaxed),
            dropped_failed: counters.dropped_failed.load(Ordering::Relaxed),
            queued: self.shared.lock_queue().len(),
        }
    }

    /// Stops accepting events and waits up to `grace` for the queue to drain.
    pub async fn shutdown(&self, grace: Duration) -> UsageStats {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            let abort = worker.abort_handle();
            if tokio::time::timeout(grace, worker).await.is_err() {
                abort.abort();
                tracing::warn!(grace_ms = grace.as_millis() as u64, "usage queue not drained before shutdown");
            }
        }
        let stats = self.stats();
        tracing::info!(delivered = stats.delivered, dropped_failed = stats.dropped_failed, dropped_overflow = stats.dropped_overflow, queued = stats.queued, "usage publisher stopped");
        stats
    }
}

impl Drop for UsagePublisher {
    fn drop(&mut self) {
        let worker = match self.worker.get_mut() {
            Ok(worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Semaphore;

    use super::*;

    fn event(request_id: &str) -> UsageEvent {
        UsageEvent {
            request_id: request_id.to_string(),
            tenant_id: "acme".to_string(),
            model: "gpt-oss-20b".to_string(),
            backend_id: Some("x".to_string()),
            input_units: 3,
            output_units: 5,
            latency_ms: 12,
            outcome: UsageOutcome::Success,
            status: Some(200),
            attempts: 1,
            decision: Some("primary".to_string()),
            stream: false,
            key_fingerprint: None,
            limit_state: None,
            timestamp_ms: 0,
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<String>>,
        failures_left: AtomicUsize,
        gate: Option<Semaphore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UsageSink for RecordingSink {
        async fn send(&self, events: &[UsageEvent]) -> Result<(), UsageSinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = self.gate.as_ref() {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|err| UsageSinkError::Other(err.to_string()))?;
                permit.forget();
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(UsageSinkError::Other("unreachable".to_string()));
            }
            let mut received = self.received.lock().expect("lock");
            received.extend(events.iter().map(|e| e.request_id.clone()));
            Ok(())
        }

        fn describe(&self) -> String {
            "recording".to_string()
        }
    }

    fn fast_config() -> UsageConfig {
        UsageConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..UsageConfig::default()
        }
    }

    #[tokio::test]
    async fn events_are_delivered_in_background() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = UsagePublisher::start(fast_config(), sink.clone());
        publisher.publish(event("a"));
        publisher.publish(event("b"));
        let stats = publisher.shutdown(Duration::from_secs(2)).await;
        assert_eq!(stats.delivered, 2);
        assert_eq!(*sink.received.lock().expect("lock"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let sink = Arc::new(RecordingSink {
            failures_left: AtomicUsize::new(2),
            ..RecordingSink::default()
        });
        let publisher = UsagePublisher::start(fast_config(), sink.clone());
        publisher.publish(event("a"));
        let stats = publisher.shutdown(Duration::from_secs(2)).await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.dropped_failed, 0);
    }

    #[tokio::test]
    async fn persistent_failure_drops_and_counts() {
        let sink = Arc::new(RecordingSink {
            failures_left: AtomicUsize::new(usize::MAX),
            ..RecordingSink::default()
        });
        let publisher = UsagePublisher::start(fast_config(), sink.clone());
        let started = std::time::Instant::now();
        publisher.publish(event("a"));
        assert!(started.elapsed() < Duration::from_millis(50));
        let stats = publisher.shutdown(Duration::from_secs(2)).await;
        assert_eq!(stats.dropped_failed, 1);
        assert_eq!(stats.retries, u64::from(fast_config().max_retries));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
    }

    async fn wait_for_first_call(sink: &RecordingSink) {
        for _ in 0..200 {
            if sink.calls.load(Ordering::SeqCst) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker never picked up the first batch");
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_by_default() {
        let sink = Arc::new(RecordingSink {
            gate: Some(Semaphore::new(0)),
            ..RecordingSink::default()
        });
        let config = UsageConfig {
            queue_capacity: 2,
            batch_size: 1,
            ..fast_config()
        };
        let publisher = UsagePublisher::start(config, sink.clone());
        publisher.publish(event("in-flight"));
        wait_for_first_call(&sink).await;

        publisher.publish(event("old"));
        publisher.publish(event("mid"));
        publisher.publish(event("new"));
        assert_eq!(publisher.stats().dropped_overflow, 1);

        if let Some(gate) = sink.gate.as_ref() {
            gate.add_permits(10);
        }
        publisher.shutdown(Duration::from_secs(2)).await;
        assert_eq!(
            *sink.received.lock().expect("lock"),
            vec!["in-flight", "mid", "new"]
        );
    }

    #[tokio::test]
    async fn drop_newest_keeps_queued_events() {
        let sink = Arc::new(RecordingSink {
            gate: Some(Semaphore::new(0)),
            ..RecordingSink::default()
        });
        let config = UsageConfig {
            queue_capacity: 1,
            batch_size: 1,
            drop_policy: DropPolicy::DropNewest,
            ..fast_config()
        };
        let publisher = UsagePublisher::start(config, sink.clone());
        publisher.publish(event("in-flight"));
        wait_for_first_call(&sink).await;

        publisher.publish(event("kept"));
        publisher.publish(event("rejected"));

        if let Some(gate) = sink.gate.as_ref() {
            gate.add_permits(10);
        }
        publisher.shutdown(Duration::from_secs(2)).await;
        assert_eq!(*sink.received.lock().expect("lock"), vec!["in-flight", "kept"]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = UsageConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            ..UsageConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(350));
        assert_eq!(config.backoff(40), Duration::from_millis(350));
    }
}
