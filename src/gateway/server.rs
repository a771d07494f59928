//! Assembles the gateway's components from a [`GatewayConfig`] and owns their background tasks.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use super::auth::AuthResolver;
use super::budget::BudgetEnforcer;
use super::config::{CounterStoreConfig, CounterStoreKind, GatewayConfig};
use super::counter_store::{CounterStore, MemoryCounterStore};
use super::dispatch::Dispatcher;
use super::http::{self, GatewayHttpState};
use super::limits::RateLimiter;
use super::observability::Observability;
use super::pipeline::{Pipeline, PipelineParts};
use super::routing::{RoutingEngine, policy_store_from_config};
use super::usage::{UsagePublisher, UsageSink, UsageStats};
use super::{AbortOnDrop, Clock, SystemClock};
use crate::Result;

/// Optional replacements for the pieces tests and embedders want to control.
#[derive(Default)]
pub struct GatewayOverrides {
    pub clock: Option<Arc<dyn Clock>>,
    pub counter_store: Option<Arc<dyn CounterStore>>,
    pub usage_sink: Option<Arc<dyn UsageSink>>,
}

pub struct GatewayServer {
    state: GatewayHttpState,
    pipeline: Arc<Pipeline>,
    refresher: AbortOnDrop,
    prober: Option<AbortOnDrop>,
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("routing", self.pipeline.routing())
            .finish_non_exhaustive()
    }
}

fn counter_store_from_config(
    config: &CounterStoreConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn CounterStore>> {
    match config.kind {
        CounterStoreKind::Memory => Ok(Arc::new(MemoryCounterStore::with_clock(clock))),
        #[cfg(feature = "store-redis")]
        CounterStoreKind::Redis => {
            let url = config.url.as_deref().unwrap_or_default();
            let store = super::counter_store::RedisCounterStore::new(url)?
                .with_prefix(config.prefix.clone())
                .with_operation_timeout(Duration::from_millis(config.operation_timeout_ms));
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "store-redis"))]
        CounterStoreKind::Redis => Err(crate::DittoError::Config(super::ConfigError::Invalid(
            "counter_store.kind = redis requires the store-redis feature".to_string(),
        ))),
    }
}

impl GatewayServer {
    pub async fn build(config: GatewayConfig) -> Result<Self> {
        Self::build_with(config, GatewayOverrides::default()).await
    }

    /// Validates `config`, performs the first policy load, and starts the refresher, the
    /// health prober and the usage publisher.
    pub async fn build_with(config: GatewayConfig, overrides: GatewayOverrides) -> Result<Self> {
        config.validate()?;
        let clock = overrides
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let counter_store = match overrides.counter_store {
            Some(store) => store,
            None => counter_store_from_config(&config.counter_store, clock.clone())?,
        };

        let auth = Arc::new(AuthResolver::from_config(&config.auth, clock.clone())?);
        let limiter = Arc::new(RateLimiter::new(
            counter_store.clone(),
            clock.clone(),
            config.rate_limits.clone(),
        ));
        let budgets = Arc::new(BudgetEnforcer::new(
            counter_store.clone(),
            clock.clone(),
            config.budgets.clone(),
        ));

        let fallback_redis_url = match config.counter_store.kind {
            CounterStoreKind::Redis => config.counter_store.url.as_deref(),
            CounterStoreKind::Memory => None,
        };
        let policy_store = policy_store_from_config(&config.routing, fallback_redis_url)?;
        let routing = Arc::new(
            RoutingEngine::new(config.routing.clone(), policy_store, clock.clone()).await?,
        );
        let refresher = routing.spawn_refresher();
        let prober = routing.spawn_prober(reqwest::Client::new());

        let sink = match overrides.usage_sink {
            Some(sink) => sink,
            None => config.usage.build_sink()?,
        };
        let usage = Arc::new(UsagePublisher::start(config.usage.clone(), sink));

        let pipeline = Arc::new(Pipeline::new(PipelineParts {
            auth,
            limiter,
            budgets,
            dispatcher: Arc::new(Dispatcher::new(routing.clone())),
            routing,
            usage,
            observability: Arc::new(Observability::default()),
            clock,
            max_timeout: Duration::from_secs(config.server.request_timeout_seconds.max(1)),
        }));

        let state = GatewayHttpState::new(pipeline.clone(), counter_store)
            .with_admin_token(config.admin.token.clone())
            .with_max_body_bytes(config.server.max_body_bytes);

        Ok(Self {
            state,
            pipeline,
            refresher,
            prober,
        })
    }

    pub fn router(&self) -> Router {
        http::router(self.state.clone())
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Stops background tasks and flushes the usage queue for at most `grace`.
    pub async fn shutdown(self, grace: Duration) -> UsageStats {
        let usage = self.pipeline.usage().clone();
        drop(self.prober);
        drop(self.refresher);
        drop(self.state);
        usage.shutdown(grace).await
    }
}
