use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::auth::AuthConfig;
use super::budget::BudgetsConfig;
use super::limits::RateLimitsConfig;
use super::routing::RoutingConfig;
use super::usage::UsageConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub base_url: String,
    /// Extra headers sent on every request to this backend, e.g. an upstream api key.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Whole-request bound for non-streaming calls.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Streaming: time allowed until the first body chunk.
    #[serde(default = "default_first_byte_timeout_seconds")]
    pub first_byte_timeout_seconds: u64,
    /// Streaming: longest silence allowed between chunks.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_path: Option<String>,
}

fn default_timeout_seconds() -> u64 {
    120
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_first_byte_timeout_seconds() -> u64 {
    30
}

fn default_idle_timeout_seconds() -> u64 {
    60
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("headers", &"<redacted>")
            .field("timeout_seconds", &self.timeout_seconds)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("first_byte_timeout_seconds", &self.first_byte_timeout_seconds)
            .field("idle_timeout_seconds", &self.idle_timeout_seconds)
            .field("health_check_path", &self.health_check_path)
            .finish()
    }
}

impl BackendConfig {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            headers: BTreeMap::new(),
            timeout_seconds: default_timeout_seconds(),
            connect_timeout_ms: default_connect_timeout_ms(),
            first_byte_timeout_seconds: default_first_byte_timeout_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            health_check_path: None,
        }
    }

    pub fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    pub fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_secs(self.first_byte_timeout_seconds.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Upper bound on the whole request. Clients may ask for less via `x-request-timeout-ms`.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    300
}

fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_shutdown_grace_seconds() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_seconds: default_request_timeout_seconds(),
            max_body_bytes: default_max_body_bytes(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Bearer for `/admin/*`; admin routes are not mounted without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterStoreKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CounterStoreConfig {
    #[serde(default)]
    pub kind: CounterStoreKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

fn default_store_prefix() -> String {
    "ditto".to_string()
}

fn default_operation_timeout_ms() -> u64 {
    250
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        Self {
            kind: CounterStoreKind::Memory,
            url: None,
            prefix: default_store_prefix(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl std::fmt::Debug for CounterStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStoreConfig")
            .field("kind", &self.kind)
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("prefix", &self.prefix)
            .field("operation_timeout_ms", &self.operation_timeout_ms)
            .finish()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
    /// OTLP/HTTP endpoint; spans are exported only when built with the `otel` feature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub counter_store: CounterStoreConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub budgets: BudgetsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Reads a json, yaml or toml config (by extension), expanding `${VAR}` references.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = parse_document(path, &raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("server.listen must not be empty".to_string()));
        }
        if self.server.request_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "server.request_timeout_seconds must be >= 1".to_string(),
            ));
        }

        self.rate_limits
            .default
            .validate()
            .map_err(|err| ConfigError::Invalid(format!("rate_limits.default: {err}")))?;
        for (tenant, profile) in &self.rate_limits.tenants {
            profile
                .validate()
                .map_err(|err| ConfigError::Invalid(format!("rate_limits.tenants.{tenant}: {err}")))?;
        }

        if !matches!(self.budgets.denial_status, 402 | 429) {
            return Err(ConfigError::Invalid(format!(
                "budgets.denial_status must be 402 or 429, got {}",
                self.budgets.denial_status
            )));
        }

        if self.counter_store.kind == CounterStoreKind::Redis
            && self.counter_store.url.as_deref().is_none_or(|url| url.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "counter_store.url is required for kind = redis".to_string(),
            ));
        }

        if self.auth.identity_url.is_none()
            && self.auth.static_keys.is_empty()
            && !self.auth.degraded_mode.enabled
        {
            return Err(ConfigError::Invalid(
                "auth needs identity_url or static_keys".to_string(),
            ));
        }

        self.routing.validate().map_err(ConfigError::Invalid)?;
        self.usage.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}

/// Deserializes `raw` using the format implied by `path`'s extension.
pub fn parse_document<T: DeserializeOwned>(path: &Path, raw: &str) -> Result<T, ConfigError> {
    let expanded = expand_env(raw)?;
    let parse_error = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "json" => serde_json::from_str(&expanded).map_err(|err| parse_error(err.to_string())),
        "toml" => toml::from_str(&expanded).map_err(|err| parse_error(err.to_string())),
        #[cfg(feature = "config-yaml")]
        "yaml" | "yml" => {
            serde_yaml::from_str(&expanded).map_err(|err| parse_error(err.to_string()))
        }
        other => Err(ConfigError::UnsupportedFormat(if other.is_empty() {
            path.display().to_string()
        } else {
            other.to_string()
        })),
    }
}

/// Replaces `${VAR}` and `${VAR:-fallback}` with environment values. `$$` escapes a dollar.
/// An empty variable counts as unset when a fallback is given.
///
/// Whole-line `#` comments are copied untouched, so a placeholder in a commented-out toml or
/// yaml line never fails the load. Trailing comments after a value are still expanded.
pub fn expand_env(raw: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(raw.len());
    for line in raw.split_inclusive('\n') {
        if line.trim_start().starts_with('#') {
            out.push_str(line);
        } else {
            expand_line(line, &mut out)?;
        }
    }
    Ok(out)
}

fn expand_line(line: &str, out: &mut String) -> Result<(), ConfigError> {
    let mut rest = line;
    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx + 1..];
        if let Some(after) = tail.strip_prefix('$') {
            out.push('$');
            rest = after;
            continue;
        }
        let Some(body) = tail.strip_prefix('{') else {
            out.push('$');
            rest = tail;
            continue;
        };
        let Some(end) = body.find('}') else {
            out.push('$');
            rest = tail;
            continue;
        };
        let expr = &body[..end];
        let (name, fallback) = match expr.split_once(":-") {
            Some((name, fallback)) => (name.trim(), Some(fallback)),
            None => (expr.trim(), None),
        };
        match (std::env::var(name), fallback) {
            (Ok(value), None) => out.push_str(&value),
            (Ok(value), Some(_)) if !value.is_empty() => out.push_str(&value),
            (_, Some(fallback)) => out.push_str(fallback),
            (Err(_), None) => return Err(ConfigError::MissingEnv(name.to_string())),
        }
        rest = &body[end + 1..];
    }
    out.push_str(rest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_substitutes_and_falls_back() {
        // SAFETY: test-local variable name, not read concurrently by other tests.
        unsafe { std::env::set_var("DITTO_ROUTER_CONFIG_TEST_KEY", "sk-upstream") };
        let out = expand_env("a=${DITTO_ROUTER_CONFIG_TEST_KEY} b=${DITTO_ROUTER_UNSET_VAR:-none} c=$$d $x")
            .expect("expand");
        assert_eq!(out, "a=sk-upstream b=none c=$d $x");

        let err = expand_env("${DITTO_ROUTER_UNSET_VAR}").expect_err("missing");
        assert!(matches!(err, ConfigError::MissingEnv(name) if name == "DITTO_ROUTER_UNSET_VAR"));
    }

    #[test]
    fn empty_variable_takes_the_fallback() {
        // SAFETY: test-local variable name, not read concurrently by other tests.
        unsafe { std::env::set_var("DITTO_ROUTER_CONFIG_TEST_EMPTY", "") };
        let out = expand_env("a=${DITTO_ROUTER_CONFIG_TEST_EMPTY:-fallback} b=[${DITTO_ROUTER_CONFIG_TEST_EMPTY}]")
            .expect("expand");
        assert_eq!(out, "a=fallback b=[]");
    }

    #[test]
    fn commented_lines_are_not_expanded() {
        let raw = "# token = \"${DITTO_ROUTER_UNSET_VAR}\"\n  # ${DITTO_ROUTER_UNSET_VAR}\nlisten = \"${DITTO_ROUTER_UNSET_VAR:-0.0.0.0:8080}\"\n";
        let out = expand_env(raw).expect("comments are skipped");
        assert_eq!(
            out,
            "# token = \"${DITTO_ROUTER_UNSET_VAR}\"\n  # ${DITTO_ROUTER_UNSET_VAR}\nlisten = \"0.0.0.0:8080\"\n"
        );

        let config: GatewayConfig = parse_document(
            Path::new("gateway.toml"),
            "# admin token comes from ${DITTO_ROUTER_UNSET_VAR}\n[server]\nlisten = \"127.0.0.1:1\"\n",
        )
        .expect("toml with commented placeholder");
        assert_eq!(config.server.listen, "127.0.0.1:1");
    }

    #[test]
    fn backend_url_joins_paths() {
        let backend = BackendConfig::new("x", "http://x.internal/");
        assert_eq!(backend.url("/v1/models"), "http://x.internal/v1/models");
        assert_eq!(backend.url("v1/models"), "http://x.internal/v1/models");
    }

    #[test]
    fn backend_debug_redacts_headers() {
        let mut backend = BackendConfig::new("x", "http://x.internal");
        backend
            .headers
            .insert("authorization".to_string(), "Bearer sk-secret".to_string());
        let debug = format!("{backend:?}");
        assert!(!debug.contains("sk-secret"));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = parse_document::<GatewayConfig>(Path::new("gateway.ini"), "").expect_err("ini");
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }

    #[test]
    fn validation_catches_bad_sections() {
        let mut config = GatewayConfig::default();
        assert!(config.validate().is_err(), "auth source required");

        config.auth.static_keys.push(super::super::auth::StaticKeyConfig::new("sk", "acme"));
        config.validate().expect("valid");

        config.budgets.denial_status = 418;
        assert!(config.validate().is_err());
        config.budgets.denial_status = 429;

        config.counter_store.kind = CounterStoreKind::Redis;
        assert!(config.validate().is_err());
    }
}
