//! Credential resolution with a short-lived local cache in front of the identity service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::OnceCell;

use super::Clock;

/// Scope a context needs to reach the completion and model endpoints.
pub const INFERENCE_SCOPE: &str = "inference";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub tenant_id: String,
    pub scopes: Vec<String>,
    pub key_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Issued by degraded mode rather than by the identity service.
    #[serde(default)]
    pub synthetic: bool,
}

impl AuthContext {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "*")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    #[default]
    Active,
    Revoked,
    Expired,
    Suspended,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityVerdict {
    pub tenant_id: String,
    pub key_id: Option<String>,
    pub scopes: Vec<String>,
    pub status: KeyStatus,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("credential not found")]
    NotFound,
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing api key")]
    MissingCredential,
    #[error("invalid api key")]
    InvalidCredential,
    #[error("api key is {0:?}")]
    Inactive(KeyStatus),
    #[error("identity service unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("api key lacks the {0:?} scope")]
    MissingScope(String),
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn validate(&self, secret: &str) -> Result<IdentityVerdict, IdentityError>;
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StaticKeyConfig {
    pub key: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default = "default_static_scopes")]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub status: KeyStatus,
}

impl std::fmt::Debug for StaticKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyConfig")
            .field("key", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field("key_id", &self.key_id)
            .field("scopes", &self.scopes)
            .field("status", &self.status)
            .finish()
    }
}

impl StaticKeyConfig {
    pub fn new(key: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            tenant_id: tenant_id.into(),
            key_id: None,
            scopes: default_static_scopes(),
            status: KeyStatus::Active,
        }
    }
}

fn default_static_scopes() -> Vec<String> {
    vec![INFERENCE_SCOPE.to_string()]
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DegradedModeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_degraded_tenant")]
    pub tenant_id: String,
    #[serde(default = "default_degraded_scopes")]
    pub scopes: Vec<String>,
}

fn default_degraded_tenant() -> String {
    "degraded".to_string()
}

fn default_degraded_scopes() -> Vec<String> {
    vec![INFERENCE_SCOPE.to_string()]
}

impl Default for DegradedModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tenant_id: default_degraded_tenant(),
            scopes: default_degraded_scopes(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the identity service. Without it only `static_keys` resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,
    #[serde(default = "default_identity_timeout_ms")]
    pub identity_timeout_ms: u64,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default)]
    pub static_keys: Vec<StaticKeyConfig>,
    #[serde(default)]
    pub degraded_mode: DegradedModeConfig,
}

fn default_identity_timeout_ms() -> u64 {
    2_000
}

fn default_cache_ttl_seconds() -> u64 {
    60
}

fn default_cache_capacity() -> usize {
    10_000
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            identity_url: None,
            identity_token: None,
            identity_timeout_ms: default_identity_timeout_ms(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            cache_capacity: default_cache_capacity(),
            static_keys: Vec::new(),
            degraded_mode: DegradedModeConfig::default(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("identity_url", &self.identity_url)
            .field("identity_token", &self.identity_token.as_ref().map(|_| "<redacted>"))
            .field("identity_timeout_ms", &self.identity_timeout_ms)
            .field("cache_ttl_seconds", &self.cache_ttl_seconds)
            .field("cache_capacity", &self.cache_capacity)
            .field("static_keys", &self.static_keys)
            .field("degraded_mode", &self.degraded_mode)
            .finish()
    }
}

/// Reads the presented secret: `x-api-key` first, then `Authorization: Bearer`.
pub fn extract_credential(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return Some(value);
    }

    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())?;
    let (scheme, token) = raw.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Stable lowercase hex SHA-256 of the secret; the only form in which keys are cached.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub struct StaticIdentityService {
    keys: HashMap<String, IdentityVerdict>,
}

impl StaticIdentityService {
    pub fn new(keys: &[StaticKeyConfig]) -> Self {
        let keys = keys
            .iter()
            .map(|key| {
                (
                    fingerprint(&key.key),
                    IdentityVerdict {
                        tenant_id: key.tenant_id.clone(),
                        key_id: key.key_id.clone(),
                        scopes: key.scopes.clone(),
                        status: key.status,
                    },
                )
            })
            .collect();
        Self { keys }
    }
}

#[async_trait]
impl IdentityService for StaticIdentityService {
    async fn validate(&self, secret: &str) -> Result<IdentityVerdict, IdentityError> {
        self.keys
            .get(&fingerprint(secret))
            .cloned()
            .ok_or(IdentityError::NotFound)
    }
}

#[derive(Debug, Serialize)]
struct ValidateKeyRequest<'a> {
    api_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateKeyResponse {
    #[serde(default = "default_valid")]
    valid: bool,
    #[serde(default, alias = "organization_id", alias = "organizationId", alias = "tenantId")]
    tenant_id: Option<String>,
    #[serde(default, alias = "apiKeyId")]
    api_key_id: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    status: Option<String>,
}

fn default_valid() -> bool {
    true
}

fn parse_status(raw: Option<&str>) -> KeyStatus {
    match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("active") => KeyStatus::Active,
        Some("revoked") => KeyStatus::Revoked,
        Some("expired") => KeyStatus::Expired,
        Some(_) => KeyStatus::Suspended,
    }
}

/// Identity service client: `POST {base}/v1/auth/validate-api-key`.
#[derive(Clone)]
pub struct HttpIdentityService {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpIdentityService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
            token: None,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|token| !token.trim().is_empty());
        self
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn validate(&self, secret: &str) -> Result<IdentityVerdict, IdentityError> {
        let url = format!(
            "{}/v1/auth/validate-api-key",
            self.base_url.trim_end_matches('/')
        );
        let mut request = self
            .client
            .post(url)
            .json(&ValidateKeyRequest { api_key: secret });
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| IdentityError::Unavailable(err.to_string()))?;
        let status = response.status();
        if matches!(status.as_u16(), 401 | 403 | 404) {
            return Err(IdentityError::NotFound);
        }
        if !status.is_success() {
            return Err(IdentityError::Unavailable(format!(
                "identity service returned {status}"
            )));
        }

        let body: ValidateKeyResponse = response
            .json()
            .await
            .map_err(|err| IdentityError::Unavailable(format!("invalid response: {err}")))?;
        if !body.valid {
            return Err(IdentityError::NotFound);
        }
        let tenant_id = body
            .tenant_id
            .filter(|tenant| !tenant.trim().is_empty())
            .ok_or_else(|| IdentityError::Unavailable("response missing tenant id".to_string()))?;

        Ok(IdentityVerdict {
            tenant_id,
            key_id: body.api_key_id,
            scopes: body.scopes,
            status: parse_status(body.status.as_deref()),
        })
    }
}

/// Tries each identity source in order; the first positive answer wins.
pub struct ChainedIdentityService {
    sources: Vec<Arc<dyn IdentityService>>,
}

impl ChainedIdentityService {
    pub fn new(sources: Vec<Arc<dyn IdentityService>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl IdentityService for ChainedIdentityService {
    async fn validate(&self, secret: &str) -> Result<IdentityVerdict, IdentityError> {
        let mut unavailable: Option<IdentityError> = None;
        for source in &self.sources {
            match source.validate(secret).await {
                Ok(verdict) => return Ok(verdict),
                Err(IdentityError::NotFound) => continue,
                Err(err) => unavailable = Some(err),
            }
        }
        Err(unavailable.unwrap_or(IdentityError::NotFound))
    }
}

/// A caller's share of an in-flight lookup. Dropping it (also on cancellation) retires the
/// entry once the lookup has finished or nobody else is waiting on it.
struct JoinedLookup<'a> {
    resolver: &'a AuthResolver,
    key_fingerprint: &'a str,
    lookup: Lookup,
}

impl<'a> JoinedLookup<'a> {
    fn join(resolver: &'a AuthResolver, key_fingerprint: &'a str) -> Self {
        let mut inflight = match resolver.inflight.lock() {
            Ok(inflight) => inflight,
            Err(poisoned) => poisoned.into_inner(),
        };
        let lookup = Arc::clone(inflight.entry(key_fingerprint.to_string()).or_default());
        Self {
            resolver,
            key_fingerprint,
            lookup,
        }
    }
}

impl Drop for JoinedLookup<'_> {
    fn drop(&mut self) {
        let mut inflight = match self.resolver.inflight.lock() {
            Ok(inflight) => inflight,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(current) = inflight.get(self.key_fingerprint) else {
            return;
        };
        // The map holds one reference and this caller another.
        let last_waiter = Arc::strong_count(current) <= 2;
        if Arc::ptr_eq(current, &self.lookup) && (self.lookup.initialized() || last_waiter) {
            inflight.remove(self.key_fingerprint);
        }
    }
}

#[derive(Clone, Debug)]
struct CachedContext {
    context: AuthContext,
    expires_at_millis: u64,
}

type Lookup = Arc<OnceCell<Result<AuthContext, AuthError>>>;

pub struct AuthResolver {
    identity: Arc<dyn IdentityService>,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<String, CachedContext>>,
    /// One identity lookup per fingerprint at a time; concurrent misses share its result.
    inflight: Mutex<HashMap<String, Lookup>>,
    cache_ttl: Duration,
    cache_capacity: usize,
    identity_timeout: Duration,
    degraded_mode: DegradedModeConfig,
}

impl AuthResolver {
    pub fn new(identity: Arc<dyn IdentityService>, clock: Arc<dyn Clock>, config: &AuthConfig) -> Self {
        if config.degraded_mode.enabled {
            tracing::warn!(
                tenant = %config.degraded_mode.tenant_id,
                "auth degraded mode is ENABLED: requests are admitted with a synthetic context when the identity service is unreachable; never use this in production"
            );
        }
        Self {
            identity,
            clock,
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
            cache_capacity: config.cache_capacity.max(1),
            identity_timeout: Duration::from_millis(config.identity_timeout_ms.max(1)),
            degraded_mode: config.degraded_mode.clone(),
        }
    }

    /// Builds the identity chain from config: static keys first, then the remote service.
    pub fn from_config(config: &AuthConfig, clock: Arc<dyn Clock>) -> Result<Self, reqwest::Error> {
        let mut sources: Vec<Arc<dyn IdentityService>> = Vec::new();
        if !config.static_keys.is_empty() {
            sources.push(Arc::new(StaticIdentityService::new(&config.static_keys)));
        }
        if let Some(url) = config.identity_url.as_deref() {
            let http = HttpIdentityService::new(url, Duration::from_millis(config.identity_timeout_ms))?
                .with_token(config.identity_token.clone());
            sources.push(Arc::new(http));
        }
        Ok(Self::new(
            Arc::new(ChainedIdentityService::new(sources)),
            clock,
            config,
        ))
    }

    pub async fn resolve(&self, credential: &str) -> Result<AuthContext, AuthError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        let key_fingerprint = fingerprint(credential);
        let now = self.clock.now_epoch_millis();

        if let Some(context) = self.cached(&key_fingerprint, now) {
            return Ok(context);
        }

        let joined = JoinedLookup::join(self, &key_fingerprint);
        joined
            .lookup
            .get_or_init(|| self.lookup(credential, key_fingerprint.clone()))
            .await
            .clone()
    }

    async fn lookup(&self, credential: &str, key_fingerprint: String) -> Result<AuthContext, AuthError> {
        let now = self.clock.now_epoch_millis();
        // A lookup that finished just before this one was joined has already filled the cache.
        if let Some(context) = self.cached(&key_fingerprint, now) {
            return Ok(context);
        }

        let verdict = match tokio::time::timeout(
            self.identity_timeout,
            self.identity.validate(credential),
        )
        .await
        {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(IdentityError::NotFound)) => return Err(AuthError::InvalidCredential),
            Ok(Err(IdentityError::Unavailable(message))) => {
                return self.unavailable(message, key_fingerprint);
            }
            Err(_) => {
                return self.unavailable(
                    format!("timed out after {:?}", self.identity_timeout),
                    key_fingerprint,
                );
            }
        };

        if verdict.status != KeyStatus::Active {
            return Err(AuthError::Inactive(verdict.status));
        }

        let context = AuthContext {
            tenant_id: verdict.tenant_id,
            scopes: verdict.scopes,
            key_fingerprint,
            key_id: verdict.key_id,
            synthetic: false,
        };
        self.store(&context, now);
        Ok(context)
    }

    fn unavailable(&self, message: String, key_fingerprint: String) -> Result<AuthContext, AuthError> {
        if !self.degraded_mode.enabled {
            tracing::error!(error = %message, "identity service unavailable, rejecting request");
            return Err(AuthError::DependencyUnavailable(message));
        }
        tracing::warn!(
            error = %message,
            tenant = %self.degraded_mode.tenant_id,
            "identity service unavailable, issuing DEGRADED synthetic auth context"
        );
        Ok(AuthContext {
            tenant_id: self.degraded_mode.tenant_id.clone(),
            scopes: self.degraded_mode.scopes.clone(),
            key_fingerprint,
            key_id: None,
            synthetic: true,
        })
    }

    fn cached(&self, key_fingerprint: &str, now_millis: u64) -> Option<AuthContext> {
        let cache = self.cache.lock().ok()?;
        cache
            .get(key_fingerprint)
            .filter(|entry| entry.expires_at_millis > now_millis)
            .map(|entry| entry.context.clone())
    }

    fn store(&self, context: &AuthContext, now_millis: u64) {
        if self.cache_ttl.is_zero() {
            return;
        }
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        if cache.len() >= self.cache_capacity {
            cache.retain(|_, entry| entry.expires_at_millis > now_millis);
        }
        if cache.len() >= self.cache_capacity {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at_millis)
                .map(|(key, _)| key.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            context.key_fingerprint.clone(),
            CachedContext {
                context: context.clone(),
                expires_at_millis: now_millis.saturating_add(self.cache_ttl.as_millis() as u64),
            },
        );
    }

    pub fn invalidate(&self, key_fingerprint: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(key_fingerprint);
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn lookups_in_flight(&self) -> usize {
        self.inflight.lock().map(|inflight| inflight.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingIdentity {
        calls: AtomicUsize,
        answer: Result<IdentityVerdict, String>,
    }

    #[async_trait]
    impl IdentityService for CountingIdentity {
        async fn validate(&self, secret: &str) -> Result<IdentityVerdict, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if secret == "unknown" {
                return Err(IdentityError::NotFound);
            }
            self.answer.clone().map_err(IdentityError::Unavailable)
        }
    }

    fn verdict(status: KeyStatus) -> IdentityVerdict {
        IdentityVerdict {
            tenant_id: "tenant-1".to_string(),
            key_id: Some("key-1".to_string()),
            scopes: vec!["inference".to_string()],
            status,
        }
    }

    fn resolver(
        answer: Result<IdentityVerdict, String>,
        config: AuthConfig,
    ) -> (AuthResolver, Arc<CountingIdentity>, Arc<ManualClock>) {
        let identity = Arc::new(CountingIdentity {
            calls: AtomicUsize::new(0),
            answer,
        });
        let clock = Arc::new(ManualClock::new(1_000_000));
        (
            AuthResolver::new(identity.clone(), clock.clone(), &config),
            identity,
            clock,
        )
    }

    #[test]
    fn credential_prefers_api_key_header_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer from-bearer".parse().unwrap());
        assert_eq!(extract_credential(&headers), Some("from-bearer"));

        headers.insert("x-api-key", "from-header".parse().unwrap());
        assert_eq!(extract_credential(&headers), Some("from-header"));

        let mut basic = HeaderMap::new();
        basic.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(extract_credential(&basic), None);
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn cache_hit_skips_identity_service_until_ttl() {
        let (resolver, identity, clock) = resolver(Ok(verdict(KeyStatus::Active)), AuthConfig::default());

        let first = resolver.resolve("sk-live").await.expect("resolve");
        let second = resolver.resolve("sk-live").await.expect("resolve");
        assert_eq!(first, second);
        assert_eq!(first.tenant_id, "tenant-1");
        assert_eq!(first.key_fingerprint, fingerprint("sk-live"));
        assert_eq!(identity.calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(61));
        resolver.resolve("sk-live").await.expect("resolve");
        assert_eq!(identity.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_and_revoked_keys_are_rejected_and_not_cached() {
        let (resolver, identity, _) = resolver(Ok(verdict(KeyStatus::Revoked)), AuthConfig::default());

        assert_eq!(
            resolver.resolve("unknown").await,
            Err(AuthError::InvalidCredential)
        );
        assert_eq!(
            resolver.resolve("sk-revoked").await,
            Err(AuthError::Inactive(KeyStatus::Revoked))
        );
        assert_eq!(
            resolver.resolve("sk-revoked").await,
            Err(AuthError::Inactive(KeyStatus::Revoked))
        );
        assert_eq!(identity.calls.load(Ordering::SeqCst), 3);
        assert_eq!(resolver.cached_entries(), 0);
    }

    #[tokio::test]
    async fn unreachable_identity_fails_closed_by_default() {
        let (resolver, _, _) = resolver(Err("connection refused".to_string()), AuthConfig::default());
        assert!(matches!(
            resolver.resolve("sk-live").await,
            Err(AuthError::DependencyUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn degraded_mode_issues_synthetic_context() {
        let config = AuthConfig {
            degraded_mode: DegradedModeConfig {
                enabled: true,
                ..DegradedModeConfig::default()
            },
            ..AuthConfig::default()
        };
        let (resolver, _, _) = resolver(Err("connection refused".to_string()), config);
        let context = resolver.resolve("sk-live").await.expect("degraded");
        assert!(context.synthetic);
        assert_eq!(context.tenant_id, "degraded");
        assert_eq!(resolver.cached_entries(), 0);
        assert_eq!(
            resolver.resolve("unknown").await,
            Err(AuthError::InvalidCredential)
        );
    }

    #[test]
    fn static_keys_default_to_the_inference_scope() {
        let parsed: StaticKeyConfig =
            serde_json::from_str(r#"{"key":"sk","tenant_id":"acme"}"#).expect("parse");
        assert_eq!(parsed.scopes, [INFERENCE_SCOPE]);
        assert_eq!(StaticKeyConfig::new("sk", "acme").scopes, [INFERENCE_SCOPE]);

        let explicit: StaticKeyConfig =
            serde_json::from_str(r#"{"key":"sk","tenant_id":"acme","scopes":[]}"#).expect("parse");
        assert!(explicit.scopes.is_empty());

        let context = AuthContext {
            tenant_id: "acme".to_string(),
            scopes: vec!["*".to_string()],
            key_fingerprint: fingerprint("sk"),
            key_id: None,
            synthetic: false,
        };
        assert!(context.has_scope(INFERENCE_SCOPE));
    }

    struct SlowIdentity {
        calls: AtomicUsize,
        answer: Result<IdentityVerdict, String>,
    }

    #[async_trait]
    impl IdentityService for SlowIdentity {
        async fn validate(&self, _secret: &str) -> Result<IdentityVerdict, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.answer.clone().map_err(IdentityError::Unavailable)
        }
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_identity_lookup() {
        for answer in [Ok(verdict(KeyStatus::Active)), Err("connection refused".to_string())] {
            let identity = Arc::new(SlowIdentity {
                calls: AtomicUsize::new(0),
                answer: answer.clone(),
            });
            let clock = Arc::new(ManualClock::new(1_000_000));
            let resolver = AuthResolver::new(identity.clone(), clock, &AuthConfig::default());

            let results =
                futures_util::future::join_all((0..8).map(|_| resolver.resolve("sk-live"))).await;
            assert_eq!(identity.calls.load(Ordering::SeqCst), 1);
            assert_eq!(resolver.lookups_in_flight(), 0);
            for result in &results {
                match &answer {
                    Ok(_) => assert_eq!(result.as_ref().expect("shared").tenant_id, "tenant-1"),
                    Err(_) => assert!(matches!(result, Err(AuthError::DependencyUnavailable(_)))),
                }
            }

            // Failures are not cached, so the next miss asks again.
            let _ = resolver.resolve("sk-live").await;
            let expected = if answer.is_ok() { 1 } else { 2 };
            assert_eq!(identity.calls.load(Ordering::SeqCst), expected);
        }
    }

    #[tokio::test]
    async fn cancelled_lookup_does_not_strand_later_callers() {
        let identity = Arc::new(SlowIdentity {
            calls: AtomicUsize::new(0),
            answer: Ok(verdict(KeyStatus::Active)),
        });
        let clock = Arc::new(ManualClock::new(1_000_000));
        let resolver = AuthResolver::new(identity.clone(), clock, &AuthConfig::default());

        let cancelled =
            tokio::time::timeout(Duration::from_millis(5), resolver.resolve("sk-live")).await;
        assert!(cancelled.is_err());
        assert_eq!(resolver.lookups_in_flight(), 0);

        let context = resolver.resolve("sk-live").await.expect("resolve");
        assert_eq!(context.tenant_id, "tenant-1");
        assert_eq!(identity.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_capacity_evicts_oldest_entry() {
        let config = AuthConfig {
            cache_capacity: 2,
            ..AuthConfig::default()
        };
        let (resolver, identity, clock) = resolver(Ok(verdict(KeyStatus::Active)), config);
        resolver.resolve("a").await.expect("a");
        clock.advance(Duration::from_secs(1));
        resolver.resolve("b").await.expect("b");
        clock.advance(Duration::from_secs(1));
        resolver.resolve("c").await.expect("c");
        assert_eq!(resolver.cached_entries(), 2);

        resolver.resolve("a").await.expect("a again");
        assert_eq!(identity.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn chained_sources_fall_through_not_found() {
        let static_keys = StaticIdentityService::new(&[StaticKeyConfig::new("sk-static", "static-tenant")]);
        let remote = Arc::new(CountingIdentity {
            calls: AtomicUsize::new(0),
            answer: Ok(verdict(KeyStatus::Active)),
        });
        let sources: Vec<Arc<dyn IdentityService>> = vec![Arc::new(static_keys), remote.clone()];
        let chain = ChainedIdentityService::new(sources);

        let verdict = chain.validate("sk-static").await.expect("static");
        assert_eq!(verdict.tenant_id, "static-tenant");
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);

        let verdict = chain.validate("sk-remote").await.expect("remote");
        assert_eq!(verdict.tenant_id, "tenant-1");
        assert!(matches!(
            chain.validate("unknown").await,
            Err(IdentityError::NotFound)
        ));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let key = StaticKeyConfig::new("sk-very-secret", "t1");
        let config = AuthConfig {
            identity_token: Some("svc-secret".to_string()),
            static_keys: vec![key],
            ..AuthConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-very-secret"));
        assert!(!rendered.contains("svc-secret"));
    }
}
