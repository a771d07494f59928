use std::path::PathBuf;
use std::sync::Mutex;
#[cfg(feature = "store-redis")]
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::policy::PolicyDocument;
use crate::gateway::config::{self, ConfigError};

#[derive(Debug, Error)]
pub enum PolicyStoreError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] ConfigError),
    #[error("invalid policy entry {key}: {message}")]
    Entry { key: String, message: String },
    #[cfg(feature = "store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("policy store timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Durable source of routing policies and backends, polled by the routing engine's single
/// refresher.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn load(&self) -> Result<PolicyDocument, PolicyStoreError>;

    fn describe(&self) -> String;
}

/// Policies held in memory; `replace` stands in for an out-of-band policy change.
#[derive(Debug, Default)]
pub struct StaticPolicyStore {
    document: Mutex<PolicyDocument>,
}

impl StaticPolicyStore {
    pub fn new(document: PolicyDocument) -> Self {
        Self {
            document: Mutex::new(document),
        }
    }

    pub fn replace(&self, document: PolicyDocument) {
        let mut guard = match self.document.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = document;
    }
}

#[async_trait]
impl PolicyStore for StaticPolicyStore {
    async fn load(&self) -> Result<PolicyDocument, PolicyStoreError> {
        let guard = match self.document.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(guard.clone())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// Policy document read from a json/yaml/toml file on every refresh.
#[derive(Clone, Debug)]
pub struct FilePolicyStore {
    path: PathBuf,
}

impl FilePolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PolicyStore for FilePolicyStore {
    async fn load(&self) -> Result<PolicyDocument, PolicyStoreError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| PolicyStoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(config::parse_document(&self.path, &raw)?)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Policies kept in two Redis hashes: `<prefix>:routing_backends` (backend id -> json) and
/// `<prefix>:routing_policies` (`<scope>:<model>` -> json).
#[cfg(feature = "store-redis")]
#[derive(Clone, Debug)]
pub struct RedisPolicyStore {
    client: redis::Client,
    prefix: String,
    timeout: Duration,
}

#[cfg(feature = "store-redis")]
impl RedisPolicyStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, PolicyStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "ditto".to_string(),
            timeout: Duration::from_secs(2),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key_policies(&self) -> String {
        format!("{}:routing_policies", self.prefix)
    }

    fn key_backends(&self) -> String {
        format!("{}:routing_backends", self.prefix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, PolicyStoreError> {
        match tokio::time::timeout(self.timeout, self.client.get_multiplexed_async_connection())
            .await
        {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(PolicyStoreError::Timeout(self.timeout)),
        }
    }

    /// Replaces both hashes in one transaction.
    pub async fn replace(&self, document: &PolicyDocument) -> Result<(), PolicyStoreError> {
        let mut conn = self.connection().await?;
        let backends_key = self.key_backends();
        let policies_key = self.key_policies();

        let mut pipe = redis::pipe();
        pipe.atomic().del(&backends_key).del(&policies_key);
        for backend in &document.backends {
            let raw = serde_json::to_string(backend).map_err(|err| PolicyStoreError::Entry {
                key: backend.id.clone(),
                message: err.to_string(),
            })?;
            pipe.hset(&backends_key, &backend.id, raw);
        }
        for policy in &document.policies {
            let raw = serde_json::to_string(policy).map_err(|err| PolicyStoreError::Entry {
                key: policy.key(),
                message: err.to_string(),
            })?;
            pipe.hset(&policies_key, policy.key(), raw);
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(feature = "store-redis")]
#[async_trait]
impl PolicyStore for RedisPolicyStore {
    async fn load(&self) -> Result<PolicyDocument, PolicyStoreError> {
        use redis::AsyncCommands;
        use std::collections::HashMap;

        let mut conn = self.connection().await?;
        let raw_backends: HashMap<String, String> = conn.hgetall(self.key_backends()).await?;
        let raw_policies: HashMap<String, String> = conn.hgetall(self.key_policies()).await?;

        let mut document = PolicyDocument::default();
        for (key, raw) in raw_backends {
            let backend = serde_json::from_str(&raw).map_err(|err| PolicyStoreError::Entry {
                key: key.clone(),
                message: err.to_string(),
            })?;
            document.backends.push(backend);
        }
        for (key, raw) in raw_policies {
            let policy: super::RoutingPolicy =
                serde_json::from_str(&raw).map_err(|err| PolicyStoreError::Entry {
                    key: key.clone(),
                    message: err.to_string(),
                })?;
            if policy.key() != key {
                return Err(PolicyStoreError::Entry {
                    message: format!("stored under {key} but resolves to {}", policy.key()),
                    key,
                });
            }
            document.policies.push(policy);
        }
        document.backends.sort_by(|a, b| a.id.cmp(&b.id));
        document.policies.sort_by_key(|policy| policy.key());
        Ok(document)
    }

    fn describe(&self) -> String {
        format!("redis:{}", self.prefix)
    }
}
