use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::RoutingError;
use crate::gateway::config::BackendConfig;

pub const GLOBAL_SCOPE: &str = "global";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRef {
    pub backend: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl BackendRef {
    pub fn new(backend: impl Into<String>, weight: u32) -> Self {
        Self {
            backend: backend.into(),
            weight,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub model: String,
    /// Owning tenant; `None` (or `"*"`) makes the policy global.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    pub backends: Vec<BackendRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(default)]
    pub version: u64,
}

impl RoutingPolicy {
    pub fn global(model: impl Into<String>, backends: Vec<BackendRef>) -> Self {
        Self {
            model: model.into(),
            tenant: None,
            backends,
            policy_id: None,
            version: 0,
        }
    }

    pub fn for_tenant(
        tenant: impl Into<String>,
        model: impl Into<String>,
        backends: Vec<BackendRef>,
    ) -> Self {
        Self {
            tenant: Some(tenant.into()),
            ..Self::global(model, backends)
        }
    }

    pub fn scope(&self) -> &str {
        match self.tenant.as_deref().map(str::trim) {
            None | Some("") | Some("*") => GLOBAL_SCOPE,
            Some(tenant) => tenant,
        }
    }

    /// `<tenant>:<model>` or `global:<model>`.
    pub fn key(&self) -> String {
        policy_key(self.scope(), &self.model)
    }
}

pub fn policy_key(scope: &str, model: &str) -> String {
    format!("{scope}:{model}")
}

/// Raw policy material as delivered by a policy store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub policies: Vec<RoutingPolicy>,
}

/// Immutable, validated view of policies and backends. Readers hold an `Arc` to one
/// generation; refreshes build a new snapshot and swap it in whole.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    pub generation: u64,
    pub loaded_at_millis: u64,
    policies: HashMap<String, Arc<RoutingPolicy>>,
    backends: HashMap<String, Arc<BackendConfig>>,
}

impl PolicySnapshot {
    pub fn build(
        document: PolicyDocument,
        generation: u64,
        loaded_at_millis: u64,
    ) -> Result<Self, RoutingError> {
        let mut backends: HashMap<String, Arc<BackendConfig>> = HashMap::new();
        for backend in document.backends {
            let id = backend.id.trim().to_string();
            if id.is_empty() {
                return Err(RoutingError::InvalidPolicy(
                    "backend id must not be empty".to_string(),
                ));
            }
            if backend.base_url.trim().is_empty() {
                return Err(RoutingError::InvalidPolicy(format!(
                    "backend {id} has no base_url"
                )));
            }
            if backends.insert(id.clone(), Arc::new(backend)).is_some() {
                return Err(RoutingError::InvalidPolicy(format!(
                    "duplicate backend id {id}"
                )));
            }
        }

        let mut policies: HashMap<String, Arc<RoutingPolicy>> = HashMap::new();
        for policy in document.policies {
            let key = policy.key();
            if policy.model.trim().is_empty() {
                return Err(RoutingError::InvalidPolicy(
                    "policy model must not be empty".to_string(),
                ));
            }
            if policy.backends.is_empty() {
                return Err(RoutingError::InvalidPolicy(format!(
                    "policy {key} has no backends"
                )));
            }
            let mut seen = HashSet::new();
            for entry in &policy.backends {
                if !backends.contains_key(&entry.backend) {
                    return Err(RoutingError::InvalidPolicy(format!(
                        "policy {key} references unknown backend {}",
                        entry.backend
                    )));
                }
                if !seen.insert(entry.backend.as_str()) {
                    return Err(RoutingError::InvalidPolicy(format!(
                        "policy {key} lists backend {} twice",
                        entry.backend
                    )));
                }
            }
            let total: u64 = policy.backends.iter().map(|b| u64::from(b.weight)).sum();
            if total == 0 {
                return Err(RoutingError::InvalidPolicy(format!(
                    "policy {key} weights must sum to more than zero"
                )));
            }
            if policies.insert(key.clone(), Arc::new(policy)).is_some() {
                return Err(RoutingError::InvalidPolicy(format!(
                    "duplicate policy {key}"
                )));
            }
        }

        Ok(Self {
            generation,
            loaded_at_millis,
            policies,
            backends,
        })
    }

    /// Tenant-scoped policy first, then the global one.
    pub fn lookup(&self, model: &str, tenant_id: &str) -> Option<&Arc<RoutingPolicy>> {
        self.policies
            .get(&policy_key(tenant_id, model))
            .or_else(|| self.policies.get(&policy_key(GLOBAL_SCOPE, model)))
    }

    pub fn backend(&self, id: &str) -> Option<&Arc<BackendConfig>> {
        self.backends.get(id)
    }

    pub fn backends(&self) -> impl Iterator<Item = &Arc<BackendConfig>> {
        self.backends.values()
    }

    pub fn backend_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn policies(&self) -> Vec<Arc<RoutingPolicy>> {
        let mut out: Vec<Arc<RoutingPolicy>> = self.policies.values().cloned().collect();
        out.sort_by_key(|policy| policy.key());
        out
    }

    /// Models the tenant can route: its own policies plus the global ones.
    pub fn models_for(&self, tenant_id: &str) -> Vec<String> {
        let models: BTreeSet<&str> = self
            .policies
            .values()
            .filter(|policy| {
                let scope = policy.scope();
                scope == GLOBAL_SCOPE || scope == tenant_id
            })
            .map(|policy| policy.model.as_str())
            .collect();
        models.into_iter().map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(id: &str) -> BackendConfig {
        BackendConfig::new(id, format!("http://{id}.internal"))
    }

    fn document() -> PolicyDocument {
        PolicyDocument {
            backends: vec![backend("x"), backend("y"), backend("z")],
            policies: vec![
                RoutingPolicy::global("gpt-oss-20b", vec![BackendRef::new("x", 1), BackendRef::new("y", 1)]),
                RoutingPolicy::for_tenant("acme", "gpt-oss-20b", vec![BackendRef::new("z", 1)]),
                RoutingPolicy::for_tenant("acme", "acme-private", vec![BackendRef::new("z", 1)]),
            ],
        }
    }

    #[test]
    fn tenant_policy_takes_precedence_over_global() {
        let snapshot = PolicySnapshot::build(document(), 1, 0).expect("snapshot");
        let acme = snapshot.lookup("gpt-oss-20b", "acme").expect("policy");
        assert_eq!(acme.key(), "acme:gpt-oss-20b");
        let other = snapshot.lookup("gpt-oss-20b", "globex").expect("policy");
        assert_eq!(other.key(), "global:gpt-oss-20b");
        assert!(snapshot.lookup("acme-private", "globex").is_none());
    }

    #[test]
    fn star_tenant_is_global() {
        let mut policy = RoutingPolicy::global("m", vec![BackendRef::new("x", 1)]);
        policy.tenant = Some("*".to_string());
        assert_eq!(policy.key(), "global:m");
    }

    #[test]
    fn models_for_merges_tenant_and_global() {
        let snapshot = PolicySnapshot::build(document(), 1, 0).expect("snapshot");
        assert_eq!(
            snapshot.models_for("acme"),
            vec!["acme-private".to_string(), "gpt-oss-20b".to_string()]
        );
        assert_eq!(snapshot.models_for("globex"), vec!["gpt-oss-20b".to_string()]);
    }

    #[test]
    fn invalid_documents_are_rejected() {
        let mut unknown = document();
        unknown.policies.push(RoutingPolicy::global("m", vec![BackendRef::new("nope", 1)]));
        assert!(PolicySnapshot::build(unknown, 1, 0).is_err());

        let mut zero = document();
        zero.policies.push(RoutingPolicy::global("m", vec![BackendRef::new("x", 0)]));
        assert!(PolicySnapshot::build(zero, 1, 0).is_err());

        let mut duplicate = document();
        duplicate.backends.push(backend("x"));
        assert!(PolicySnapshot::build(duplicate, 1, 0).is_err());

        let mut repeated = document();
        repeated.policies.push(RoutingPolicy::global(
            "m",
            vec![BackendRef::new("x", 1), BackendRef::new("x", 2)],
        ));
        assert!(PolicySnapshot::build(repeated, 1, 0).is_err());
    }
}
