//! Routing policy engine: a policy snapshot swapped atomically by one background refresher,
//! a live backend health table, and weighted selection with health-aware failover.

mod health;
mod policy;
mod select;
mod store;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use super::Clock;
use super::config::BackendConfig;
use crate::utils::task::AbortOnDrop;

pub use health::{BackendHealthSnapshot, HealthStatus, HealthTable, HealthThresholds, Observation};
pub use policy::{
    BackendRef, GLOBAL_SCOPE, PolicyDocument, PolicySnapshot, RoutingPolicy, policy_key,
};
pub use select::{order_candidates, random_roll};
#[cfg(feature = "store-redis")]
pub use store::RedisPolicyStore;
pub use store::{FilePolicyStore, PolicyStore, PolicyStoreError, StaticPolicyStore};

const DECISION_LOG_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no routing policy for model {model}")]
    NoPolicy { model: String },
    #[error("no healthy backend for model {model}")]
    NoHealthyBackend { model: String },
    #[error("invalid routing policy: {0}")]
    InvalidPolicy(String),
    #[error(transparent)]
    Store(#[from] PolicyStoreError),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicySource {
    /// Only the policies written inline in the gateway config.
    #[default]
    Static,
    File { path: PathBuf },
    Redis {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default = "default_policy_prefix")]
        prefix: String,
    },
}

fn default_policy_prefix() -> String {
    "ditto".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_probe_path")]
    pub path: String,
    #[serde(default = "default_probe_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_probe_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_probe_path() -> String {
    "/v1/models".to_string()
}

fn default_probe_interval_seconds() -> u64 {
    10
}

fn default_probe_timeout_seconds() -> u64 {
    5
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_probe_path(),
            interval_seconds: default_probe_interval_seconds(),
            timeout_seconds: default_probe_timeout_seconds(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub thresholds: HealthThresholds,
    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub policies: Vec<RoutingPolicy>,
    #[serde(default)]
    pub source: PolicySource,
    #[serde(default = "default_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
    /// Distinct backends tried per request, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Let one request through to a suspect backend when nothing is healthy.
    #[serde(default = "default_true")]
    pub canary: bool,
    #[serde(default)]
    pub health: HealthConfig,
}

fn default_refresh_interval_seconds() -> u64 {
    30
}

fn default_max_attempts() -> usize {
    3
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            policies: Vec::new(),
            source: PolicySource::default(),
            refresh_interval_seconds: default_refresh_interval_seconds(),
            max_attempts: default_max_attempts(),
            canary: true,
            health: HealthConfig::default(),
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("routing.max_attempts must be >= 1".to_string());
        }
        self.health.thresholds.validate()?;
        if let PolicySource::File { path } = &self.source {
            if path.as_os_str().is_empty() {
                return Err("routing.source.path must not be empty".to_string());
            }
        }
        Ok(())
    }

    fn base_document(&self) -> PolicyDocument {
        PolicyDocument {
            backends: self.backends.clone(),
            policies: self.policies.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// The policy had a single eligible backend.
    Primary,
    /// Weighted choice among several eligible backends.
    Weighted,
    /// The request was served by a backend other than the first candidate.
    Failover,
    /// Single probe request to a suspect backend.
    Canary,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Primary => "primary",
            DecisionKind::Weighted => "weighted",
            DecisionKind::Failover => "failover",
            DecisionKind::Canary => "canary",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RouteCandidate {
    pub backend: Arc<BackendConfig>,
    pub weight: u32,
}

/// Ordered candidates for one request, already capped at the attempt budget.
#[derive(Clone, Debug)]
pub struct RoutePlan {
    pub model: String,
    pub policy_key: String,
    pub decision: DecisionKind,
    pub candidates: Vec<RouteCandidate>,
}

impl RoutePlan {
    pub fn primary(&self) -> Option<&RouteCandidate> {
        self.candidates.first()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingDecisionRecord {
    pub ts_ms: u64,
    pub request_id: String,
    pub tenant_id: String,
    pub model: String,
    pub policy_key: String,
    pub decision: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    pub attempts: usize,
    pub outcome: String,
}

type RollFn = dyn Fn() -> u64 + Send + Sync;

pub struct RoutingEngine {
    config: RoutingConfig,
    base: PolicyDocument,
    store: Arc<dyn PolicyStore>,
    snapshot: ArcSwap<PolicySnapshot>,
    health: HealthTable,
    generation: AtomicU64,
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_signal: Notify,
    decisions: Mutex<VecDeque<RoutingDecisionRecord>>,
    roll: Box<RollFn>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("store", &self.store.describe())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RoutingEngine {
    /// Builds the engine and performs the first policy load. Inline config policies form
    /// the base; documents from `store` are layered on top by backend id and policy key.
    pub async fn new(
        config: RoutingConfig,
        store: Arc<dyn PolicyStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RoutingError> {
        config.validate().map_err(RoutingError::InvalidPolicy)?;
        let engine = Self {
            base: config.base_document(),
            health: HealthTable::new(config.health.thresholds.clone(), clock.clone()),
            config,
            store,
            snapshot: ArcSwap::from_pointee(PolicySnapshot::default()),
            generation: AtomicU64::new(0),
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_signal: Notify::new(),
            decisions: Mutex::new(VecDeque::with_capacity(DECISION_LOG_CAPACITY)),
            roll: Box::new(random_roll),
            clock,
        };
        engine.refresh().await?;
        Ok(engine)
    }

    /// Replaces the random source used for weighted selection.
    pub fn with_roll(mut self, roll: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.roll = Box::new(roll);
        self
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load_full()
    }

    pub fn health(&self) -> &HealthTable {
        &self.health
    }

    /// Reloads the store and swaps in a new snapshot. A failed load or an invalid document
    /// leaves the current snapshot in place.
    pub async fn refresh(&self) -> Result<u64, RoutingError> {
        let _guard = self.refresh_lock.lock().await;
        let loaded = match self.store.load().await {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(store = %self.store.describe(), error = %err, "policy refresh failed");
                return Err(err.into());
            }
        };

        let document = overlay(self.base.clone(), loaded);
        let generation = self.generation.load(Ordering::SeqCst) + 1;
        let snapshot =
            match PolicySnapshot::build(document, generation, self.clock.now_epoch_millis()) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(store = %self.store.describe(), error = %err, "rejected policy document");
                    return Err(err);
                }
            };

        self.health.sync_backends(&snapshot.backend_ids());
        let policies = snapshot.policies().len();
        self.snapshot.store(Arc::new(snapshot));
        self.generation.store(generation, Ordering::SeqCst);
        tracing::info!(generation, policies, store = %self.store.describe(), "routing policies loaded");
        Ok(generation)
    }

    /// Wakes the background refresher ahead of its interval.
    pub fn request_refresh(&self) {
        self.refresh_signal.notify_one();
    }

    /// Single writer for the policy snapshot: refreshes on a fixed interval and on demand.
    pub fn spawn_refresher(self: &Arc<Self>) -> AbortOnDrop {
        let engine = Arc::clone(self);
        let interval = Duration::from_secs(self.config.refresh_interval_seconds.max(1));
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = engine.refresh_signal.notified() => {}
                }
                let _ = engine.refresh().await;
            }
        });
        AbortOnDrop::new(task.abort_handle())
    }

    /// Background probes feeding the health table; `None` when probing is disabled.
    pub fn spawn_prober(self: &Arc<Self>, client: reqwest::Client) -> Option<AbortOnDrop> {
        let probe = self.config.health.probe.clone();
        if !probe.enabled {
            return None;
        }
        let engine = Arc::clone(self);
        let interval = Duration::from_secs(probe.interval_seconds.max(1));
        let timeout = Duration::from_secs(probe.timeout_seconds.max(1));

        let task = tokio::spawn(async move {
            loop {
                engine.check_backends(&client, &probe.path, timeout).await;
                tokio::time::sleep(interval).await;
            }
        });
        Some(AbortOnDrop::new(task.abort_handle()))
    }

    /// One health check round. Backends are checked concurrently so a hung backend only
    /// delays its own observation.
    pub async fn check_backends(
        &self,
        client: &reqwest::Client,
        default_path: &str,
        timeout: Duration,
    ) {
        let snapshot = self.snapshot();
        let checks = snapshot.backends().map(|backend| async move {
            let path = backend
                .health_check_path
                .as_deref()
                .unwrap_or(default_path);
            let request = backend
                .apply_headers(client.get(backend.url(path)))
                .timeout(timeout);
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    self.health.observe(&backend.id, Observation::ProbeSuccess, None);
                }
                Ok(response) => {
                    self.health.observe(
                        &backend.id,
                        Observation::ProbeFailure,
                        Some(format!("health check returned {}", response.status())),
                    );
                }
                Err(err) => {
                    self.health.observe(
                        &backend.id,
                        Observation::ProbeFailure,
                        Some(err.to_string()),
                    );
                }
            }
        });
        futures_util::future::join_all(checks).await;
    }

    /// Picks the backend the request should go to first.
    pub fn select(&self, model: &str, tenant_id: &str) -> Result<BackendRef, RoutingError> {
        let plan = self.plan(model, tenant_id)?;
        plan.primary()
            .map(|candidate| BackendRef::new(candidate.backend.id.clone(), candidate.weight))
            .ok_or_else(|| RoutingError::NoHealthyBackend {
                model: model.to_string(),
            })
    }

    /// Resolves the policy (tenant first, then global) and orders its eligible backends.
    /// Healthy backends are preferred; when none are healthy a single suspect backend may be
    /// tried as a canary.
    pub fn plan(&self, model: &str, tenant_id: &str) -> Result<RoutePlan, RoutingError> {
        let snapshot = self.snapshot.load();
        let Some(policy) = snapshot.lookup(model, tenant_id) else {
            return Err(RoutingError::NoPolicy {
                model: model.to_string(),
            });
        };

        let statuses = self.health.statuses();
        let status_of = |id: &str| statuses.get(id).copied().unwrap_or_default();

        let healthy: Vec<&BackendRef> = policy
            .backends
            .iter()
            .filter(|entry| status_of(&entry.backend) == HealthStatus::Healthy)
            .collect();

        let (decision, ordered) = if !healthy.is_empty() {
            let ordered = order_candidates(&healthy, (self.roll)());
            let decision = if ordered.len() == 1 {
                DecisionKind::Primary
            } else {
                DecisionKind::Weighted
            };
            (decision, ordered)
        } else if self.config.canary {
            let mut suspects: Vec<&BackendRef> = policy
                .backends
                .iter()
                .filter(|entry| status_of(&entry.backend) == HealthStatus::Suspect)
                .collect();
            suspects.sort_by(|a, b| b.weight.cmp(&a.weight));
            let canary = suspects
                .into_iter()
                .find(|entry| self.health.try_acquire_canary(&entry.backend));
            match canary {
                Some(entry) => {
                    tracing::info!(backend = %entry.backend, model, "routing canary request to suspect backend");
                    (DecisionKind::Canary, vec![entry.clone()])
                }
                None => (DecisionKind::Canary, Vec::new()),
            }
        } else {
            (DecisionKind::Primary, Vec::new())
        };

        let candidates: Vec<RouteCandidate> = ordered
            .into_iter()
            .filter_map(|entry| {
                snapshot
                    .backend(&entry.backend)
                    .map(|backend| RouteCandidate {
                        backend: Arc::clone(backend),
                        weight: entry.weight,
                    })
            })
            .take(self.config.max_attempts.max(1))
            .collect();

        if candidates.is_empty() {
            return Err(RoutingError::NoHealthyBackend {
                model: model.to_string(),
            });
        }

        Ok(RoutePlan {
            model: model.to_string(),
            policy_key: policy.key(),
            decision,
            candidates,
        })
    }

    /// Feeds one live-traffic outcome into the health state machine.
    pub fn report(&self, backend: &str, success: bool, message: Option<String>) {
        let observation = if success {
            Observation::TrafficSuccess
        } else {
            Observation::TrafficFailure
        };
        self.health.observe(backend, observation, message);
    }

    pub fn force_health(&self, backend: &str, status: HealthStatus) -> bool {
        let changed = self.health.force(backend, status);
        if changed {
            tracing::warn!(backend, status = ?status, "backend health overridden");
        }
        changed
    }

    pub fn record_decision(&self, record: RoutingDecisionRecord) {
        let mut decisions = match self.decisions.lock() {
            Ok(decisions) => decisions,
            Err(poisoned) => poisoned.into_inner(),
        };
        if decisions.len() >= DECISION_LOG_CAPACITY {
            decisions.pop_front();
        }
        decisions.push_back(record);
    }

    /// Most recent routing decisions, oldest first.
    pub fn decisions(&self) -> Vec<RoutingDecisionRecord> {
        let decisions = match self.decisions.lock() {
            Ok(decisions) => decisions,
            Err(poisoned) => poisoned.into_inner(),
        };
        decisions.iter().cloned().collect()
    }
}

fn overlay(base: PolicyDocument, top: PolicyDocument) -> PolicyDocument {
    let mut backends: Vec<BackendConfig> = Vec::new();
    let mut backend_index: HashMap<String, usize> = HashMap::new();
    for backend in base.backends.into_iter().chain(top.backends) {
        match backend_index.get(&backend.id) {
            Some(idx) => backends[*idx] = backend,
            None => {
                backend_index.insert(backend.id.clone(), backends.len());
                backends.push(backend);
            }
        }
    }

    let mut policies: Vec<RoutingPolicy> = Vec::new();
    let mut policy_index: HashMap<String, usize> = HashMap::new();
    for policy in base.policies.into_iter().chain(top.policies) {
        let key = policy.key();
        match policy_index.get(&key) {
            Some(idx) => policies[*idx] = policy,
            None => {
                policy_index.insert(key, policies.len());
                policies.push(policy);
            }
        }
    }

    PolicyDocument { backends, policies }
}

/// Builds the policy store named by `config.source`. `fallback_redis_url` is used when a
/// Redis source does not carry its own url.
pub fn policy_store_from_config(
    config: &RoutingConfig,
    fallback_redis_url: Option<&str>,
) -> Result<Arc<dyn PolicyStore>, RoutingError> {
    match &config.source {
        PolicySource::Static => Ok(Arc::new(StaticPolicyStore::default())),
        PolicySource::File { path } => Ok(Arc::new(FilePolicyStore::new(path.clone()))),
        #[cfg(feature = "store-redis")]
        PolicySource::Redis { url, prefix } => {
            let Some(url) = url.as_deref().or(fallback_redis_url) else {
                return Err(RoutingError::InvalidPolicy(
                    "redis policy source needs a url".to_string(),
                ));
            };
            Ok(Arc::new(RedisPolicyStore::new(url)?.with_prefix(prefix.clone())))
        }
        #[cfg(not(feature = "store-redis"))]
        PolicySource::Redis { .. } => {
            let _ = fallback_redis_url;
            Err(RoutingError::InvalidPolicy(
                "redis policy source requires the store-redis feature".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;

    fn two_backend_config() -> RoutingConfig {
        RoutingConfig {
            backends: vec![
                BackendConfig::new("x", "http://x.internal"),
                BackendConfig::new("y", "http://y.internal"),
            ],
            policies: vec![RoutingPolicy::global(
                "gpt-oss-20b",
                vec![BackendRef::new("x", 1), BackendRef::new("y", 1)],
            )],
            ..RoutingConfig::default()
        }
    }

    async fn engine(config: RoutingConfig) -> (Arc<RoutingEngine>, Arc<StaticPolicyStore>) {
        let store = Arc::new(StaticPolicyStore::default());
        let engine = RoutingEngine::new(config, store.clone(), Arc::new(ManualClock::new(0)))
            .await
            .expect("engine");
        (Arc::new(engine), store)
    }

    fn mark_unhealthy(engine: &RoutingEngine, backend: &str) {
        assert!(engine.force_health(backend, HealthStatus::Unhealthy));
    }

    #[tokio::test]
    async fn health_checks_run_concurrently_across_backends() {
        let hung = httpmock::MockServer::start_async().await;
        hung.mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/health");
            then.status(200).delay(Duration::from_secs(3));
        })
        .await;
        let up = httpmock::MockServer::start_async().await;
        up.mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/health");
            then.status(200);
        })
        .await;

        let config = RoutingConfig {
            backends: vec![
                BackendConfig::new("a", hung.base_url()),
                BackendConfig::new("b", hung.base_url()),
                BackendConfig::new("c", up.base_url()),
            ],
            policies: vec![RoutingPolicy::global(
                "gpt-oss-20b",
                vec![
                    BackendRef::new("a", 1),
                    BackendRef::new("b", 1),
                    BackendRef::new("c", 1),
                ],
            )],
            ..RoutingConfig::default()
        };
        let (engine, _) = engine(config).await;

        let started = std::time::Instant::now();
        engine
            .check_backends(&reqwest::Client::new(), "/health", Duration::from_secs(1))
            .await;
        assert!(started.elapsed() < Duration::from_millis(1800));

        for hung in ["a", "b"] {
            assert_eq!(engine.health().status(hung), HealthStatus::Suspect, "{hung}");
        }
        let snapshot = engine.health().backend_snapshot("c").expect("snapshot");
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert!(snapshot.last_probe_ts_ms.is_some());
    }

    #[tokio::test]
    async fn unhealthy_backend_never_selected() {
        let (engine, _) = engine(two_backend_config()).await;
        mark_unhealthy(&engine, "x");
        for _ in 0..1_000 {
            let picked = engine.select("gpt-oss-20b", "acme").expect("select");
            assert_eq!(picked.backend, "y");
        }
    }

    #[tokio::test]
    async fn all_unhealthy_yields_no_healthy_backend() {
        let (engine, _) = engine(two_backend_config()).await;
        mark_unhealthy(&engine, "x");
        mark_unhealthy(&engine, "y");
        let err = engine.plan("gpt-oss-20b", "acme").expect_err("no backend");
        assert!(matches!(err, RoutingError::NoHealthyBackend { .. }));
    }

    #[tokio::test]
    async fn unknown_model_has_no_policy() {
        let (engine, _) = engine(two_backend_config()).await;
        let err = engine.plan("missing", "acme").expect_err("no policy");
        assert!(matches!(err, RoutingError::NoPolicy { .. }));
    }

    #[tokio::test]
    async fn plan_lists_failover_candidates_within_attempt_budget() {
        let mut config = two_backend_config();
        config.backends.push(BackendConfig::new("z", "http://z.internal"));
        config.policies = vec![RoutingPolicy::global(
            "gpt-oss-20b",
            vec![
                BackendRef::new("x", 5),
                BackendRef::new("y", 1),
                BackendRef::new("z", 3),
            ],
        )];
        config.max_attempts = 2;
        let (engine, _) = engine(config).await;
        let engine = Arc::try_unwrap(engine).expect("unique").with_roll(|| 0);

        let plan = engine.plan("gpt-oss-20b", "acme").expect("plan");
        let ids: Vec<&str> = plan.candidates.iter().map(|c| c.backend.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "z"]);
        assert_eq!(plan.decision, DecisionKind::Weighted);
        assert_eq!(plan.policy_key, "global:gpt-oss-20b");
    }

    #[tokio::test]
    async fn suspect_backend_gets_a_single_canary() {
        let (engine, _) = engine(two_backend_config()).await;
        mark_unhealthy(&engine, "x");
        assert!(engine.force_health("y", HealthStatus::Suspect));

        let plan = engine.plan("gpt-oss-20b", "acme").expect("canary");
        assert_eq!(plan.decision, DecisionKind::Canary);
        assert_eq!(plan.candidates.len(), 1);
        assert_eq!(plan.candidates[0].backend.id, "y");

        assert!(engine.plan("gpt-oss-20b", "acme").is_err());
        engine.report("y", true, None);
        assert!(engine.plan("gpt-oss-20b", "acme").is_ok());
    }

    #[tokio::test]
    async fn canary_can_be_disabled() {
        let mut config = two_backend_config();
        config.canary = false;
        let (engine, _) = engine(config).await;
        mark_unhealthy(&engine, "x");
        assert!(engine.force_health("y", HealthStatus::Suspect));
        assert!(engine.plan("gpt-oss-20b", "acme").is_err());
    }

    #[tokio::test]
    async fn refresh_swaps_snapshot_and_keeps_it_on_bad_document() {
        let (engine, store) = engine(two_backend_config()).await;
        let first = engine.snapshot();
        assert_eq!(first.generation, 1);

        store.replace(PolicyDocument {
            backends: vec![BackendConfig::new("t", "http://t.internal")],
            policies: vec![RoutingPolicy::for_tenant(
                "acme",
                "gpt-oss-20b",
                vec![BackendRef::new("t", 1)],
            )],
        });
        assert_eq!(engine.refresh().await.expect("refresh"), 2);
        assert_eq!(engine.select("gpt-oss-20b", "acme").expect("select").backend, "t");
        assert_ne!(engine.select("gpt-oss-20b", "globex").expect("select").backend, "t");
        // Readers holding the old snapshot keep a consistent view.
        assert!(first.lookup("gpt-oss-20b", "acme").expect("old").tenant.is_none());

        store.replace(PolicyDocument {
            backends: Vec::new(),
            policies: vec![RoutingPolicy::global("m", vec![BackendRef::new("ghost", 1)])],
        });
        assert!(engine.refresh().await.is_err());
        assert_eq!(engine.snapshot().generation, 2);
    }

    #[tokio::test]
    async fn refresher_reacts_to_signal() {
        let (engine, store) = engine(two_backend_config()).await;
        let _refresher = engine.spawn_refresher();
        store.replace(PolicyDocument {
            backends: Vec::new(),
            policies: vec![RoutingPolicy::global("other", vec![BackendRef::new("x", 1)])],
        });
        engine.request_refresh();
        for _ in 0..100 {
            if engine.snapshot().lookup("other", "acme").is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("refresh signal was not picked up");
    }

    #[tokio::test]
    async fn decision_log_is_bounded() {
        let (engine, _) = engine(two_backend_config()).await;
        for idx in 0..150 {
            engine.record_decision(RoutingDecisionRecord {
                ts_ms: idx,
                request_id: format!("req-{idx}"),
                tenant_id: "acme".to_string(),
                model: "gpt-oss-20b".to_string(),
                policy_key: "global:gpt-oss-20b".to_string(),
                decision: DecisionKind::Primary,
                backend: Some("x".to_string()),
                attempts: 1,
                outcome: "success".to_string(),
            });
        }
        let decisions = engine.decisions();
        assert_eq!(decisions.len(), DECISION_LOG_CAPACITY);
        assert_eq!(decisions[0].request_id, "req-50");
    }
}
