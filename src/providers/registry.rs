//! Registered services and their policies.
//!
//! A [`ServiceDescriptor`] bundles an adapter with the [`ServicePolicy`] that
//! governs it and, optionally, a credential pool. Descriptors are created
//! once at registration and never change afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::fallback::FallbackPolicy;
use super::keys::KeyPool;
use super::retry::RetryPolicy;
use super::traits::ProviderAdapter;
use crate::cache::TtlPolicy;
use crate::quota::RateLimitPolicy;
use crate::types::DataType;
use crate::{Result, SkirnirError};

/// Caching behaviour for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Default: true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Data type assumed for this service's payloads. Default: generic.
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub ttl: TtlPolicy,
}

fn default_enabled() -> bool {
    true
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            data_type: DataType::default(),
            ttl: TtlPolicy::default(),
        }
    }
}

impl CachePolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn for_data_type(data_type: DataType) -> Self {
        Self {
            data_type,
            ..Self::default()
        }
    }

    pub fn ttl(mut self, ttl: TtlPolicy) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Everything the orchestrator needs to know about how to call a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePolicy {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    #[serde(default)]
    pub cache: CachePolicy,
    /// Per-attempt timeout. Default: 30,000.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Environment variables holding this service's credentials, in pool order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_env: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
            fallback: FallbackPolicy::default(),
            cache: CachePolicy::default(),
            timeout_ms: default_timeout_ms(),
            key_env: Vec::new(),
        }
    }
}

impl ServicePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn key_env(mut self, var: impl Into<String>) -> Self {
        self.key_env.push(var.into());
        self
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Credentials named by `key_env`. Unset or empty variables are skipped.
    pub fn keys_from_env(&self) -> Vec<SecretString> {
        self.key_env
            .iter()
            .filter_map(|var| match std::env::var(var) {
                Ok(value) if !value.trim().is_empty() => Some(SecretString::new(value)),
                _ => {
                    warn!(var = %var, "credential environment variable not set");
                    None
                }
            })
            .collect()
    }
}

/// A registered service.
pub struct ServiceDescriptor {
    pub name: String,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub policy: ServicePolicy,
    /// `None` when the adapter needs no credentials.
    pub keys: Option<KeyPool>,
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("adapter", &self.adapter.name())
            .field("policy", &self.policy)
            .field("keys", &self.keys)
            .finish()
    }
}

/// Explicit name → service map.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceDescriptor>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service, replacing any previous registration under the same name.
    pub fn register(&mut self, descriptor: ServiceDescriptor) {
        if self.services.contains_key(&descriptor.name) {
            warn!(service = %descriptor.name, "replacing registered service");
        }
        self.services
            .insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    pub fn get(&self, name: &str) -> Result<&Arc<ServiceDescriptor>> {
        self.services
            .get(name)
            .ok_or_else(|| SkirnirError::ServiceNotFound(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Check cross-service references (backup providers).
    pub fn validate(&self) -> Result<()> {
        for service in self.services.values() {
            for backup in service.policy.fallback.backups() {
                if backup == service.name {
                    return Err(SkirnirError::Configuration(format!(
                        "service '{}' names itself as backup",
                        service.name
                    )));
                }
                if !self.services.contains_key(backup) {
                    return Err(SkirnirError::Configuration(format!(
                        "service '{}' names unknown backup '{backup}'",
                        service.name
                    )));
                }
            }
        }
        Ok(())
    }
}
