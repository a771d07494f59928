//! Admission-and-routing gateway: auth, rate limits, budgets, routing, dispatch and usage.

pub mod auth;
pub mod budget;
pub mod config;
pub mod counter_store;
pub mod dispatch;
pub mod http;
pub mod limits;
pub mod observability;
pub mod otel;
pub mod pipeline;
pub mod routing;
pub mod server;
pub mod usage;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

pub use crate::utils::task::AbortOnDrop;

pub use auth::{AuthContext, AuthError, AuthResolver, IdentityService};
pub use budget::{BudgetDecision, BudgetEnforcer};
pub use config::{BackendConfig, ConfigError, GatewayConfig};
pub use counter_store::{CounterStore, CounterStoreError, MemoryCounterStore};
pub use dispatch::{DispatchError, Dispatcher, UpstreamRequest};
pub use http::GatewayHttpState;
pub use limits::{RateDecision, RateLimiter};
pub use observability::{Observability, ObservabilitySnapshot};
pub use pipeline::{Pipeline, PipelineError, Stage};
pub use routing::{RoutingEngine, RoutingError};
pub use server::{GatewayOverrides, GatewayServer};
pub use usage::{UsageEvent, UsagePublisher, UsageSink};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid api key: {reason}")]
    InvalidCredential { reason: String },
    #[error("identity service unavailable: {message}")]
    AuthUnavailable { message: String },
    #[error("permission denied: {reason}")]
    Forbidden { reason: String },
    #[error("rate limit exceeded: limit={limit} retry_after_ms={}", retry_after.as_millis())]
    RateLimited {
        limit: u32,
        remaining: u32,
        retry_after: Duration,
        reset_after: Duration,
    },
    #[error("budget exceeded: limit={limit} consumed={consumed} attempted={attempted}")]
    BudgetExceeded {
        limit: u64,
        consumed: u64,
        attempted: u64,
        /// Time until the budget period rolls over; `None` for lifetime budgets.
        resets_after: Option<Duration>,
    },
    #[error("no routing policy for model {model}")]
    NoPolicy { model: String },
    #[error("no healthy backend for model {model}")]
    NoHealthyBackend { model: String },
    #[error("all {attempts} backend attempts failed: {last_error}")]
    BackendsExhausted { attempts: usize, last_error: String },
    #[error("backend {backend} timed out")]
    BackendTimeout { backend: String },
    #[error("backend {backend} failed: {message}")]
    Backend { backend: String, message: String },
    #[error("dependency unavailable: {message}")]
    DependencyUnavailable { message: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("request cancelled by client")]
    Cancelled,
}

pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> u64;

    fn now_epoch_seconds(&self) -> u64 {
        self.now_epoch_millis() / 1000
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        now.as_millis() as u64
    }
}

/// Clock advanced by hand, for deterministic refill and expiry in tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_epoch_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_epoch_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, epoch_millis: u64) {
        self.millis.store(epoch_millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
