//! Builder for configuring orchestrator instances

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use secrecy::SecretString;
use tracing::{debug, info, warn};

use super::{DEFAULT_FAILURE_ALERT_THRESHOLD, MaintenanceConfig, Orchestrator};
use crate::Result;
use crate::cache::{AdaptiveCache, CacheConfig};
use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::geo::ClusterOptions;
use crate::notify::{Notifier, TracingNotifier};
use crate::providers::{KeyPool, ProviderAdapter, ServiceDescriptor, ServicePolicy, ServiceRegistry};
use crate::quota::QuotaTracker;
use crate::store::{DurableStore, MemoryStore};

struct PendingService {
    name: String,
    adapter: Arc<dyn ProviderAdapter>,
    policy: Option<ServicePolicy>,
    keys: Option<Vec<SecretString>>,
}

/// Builder for [`Orchestrator`].
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use skirnir::{Orchestrator, ServicePolicy};
/// # async fn demo(weather: Arc<dyn skirnir::ProviderAdapter>) -> skirnir::Result<()> {
/// let orchestrator = Orchestrator::builder()
///     .register_service("weather", weather, ServicePolicy::new())
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct OrchestratorBuilder {
    clock: Option<Arc<dyn Clock>>,
    notifier: Option<Arc<dyn Notifier>>,
    store: Option<Arc<dyn DurableStore>>,
    cache: CacheConfig,
    cluster: ClusterOptions,
    maintenance: MaintenanceConfig,
    failure_alert_threshold: u32,
    configured: HashMap<String, ServicePolicy>,
    services: Vec<PendingService>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            clock: None,
            notifier: None,
            store: None,
            cache: CacheConfig::default(),
            cluster: ClusterOptions::default(),
            maintenance: MaintenanceConfig::default(),
            failure_alert_threshold: DEFAULT_FAILURE_ALERT_THRESHOLD,
            configured: HashMap::new(),
            services: Vec::new(),
        }
    }

    /// Take cache, clustering, maintenance settings and per-service policies
    /// from a loaded config file.
    pub fn config(mut self, config: &OrchestratorConfig) -> Self {
        self.cache = config.cache.clone();
        self.cluster = config.geo;
        self.maintenance = config.maintenance.clone();
        self.failure_alert_threshold = config.failure_alert_threshold;
        self.configured = config.services.clone();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Durable tier for quota state and promoted cache entries.
    ///
    /// Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    pub fn cluster_options(mut self, options: ClusterOptions) -> Self {
        self.cluster = options;
        self
    }

    pub fn maintenance(mut self, config: MaintenanceConfig) -> Self {
        self.maintenance = config;
        self
    }

    pub fn failure_alert_threshold(mut self, failures: u32) -> Self {
        self.failure_alert_threshold = failures.max(1);
        self
    }

    /// Register a service. Credentials, if any, come from `policy.key_env`.
    pub fn register_service(
        mut self,
        name: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
        policy: ServicePolicy,
    ) -> Self {
        self.services.push(PendingService {
            name: name.into(),
            adapter,
            policy: Some(policy),
            keys: None,
        });
        self
    }

    /// Register a service with an explicit credential pool.
    pub fn register_service_with_keys(
        mut self,
        name: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
        policy: ServicePolicy,
        keys: impl IntoIterator<Item = SecretString>,
    ) -> Self {
        self.services.push(PendingService {
            name: name.into(),
            adapter,
            policy: Some(policy),
            keys: Some(keys.into_iter().collect()),
        });
        self
    }

    /// Register a service whose policy comes from [`config`](Self::config).
    pub fn register_adapter(mut self, name: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.services.push(PendingService {
            name: name.into(),
            adapter,
            policy: None,
            keys: None,
        });
        self
    }

    /// Build the orchestrator.
    ///
    /// An unreachable store is not fatal: the orchestrator continues with an
    /// in-memory store and logs a warning. Persisted quota state is restored
    /// before the first call.
    pub async fn build(self) -> Result<Orchestrator> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));

        let store: Arc<dyn DurableStore> = match self.store {
            Some(store) => match store.ping().await {
                Ok(()) => store,
                Err(e) => {
                    warn!(store = store.name(), error = %e, "durable store unreachable, running memory-only");
                    Arc::new(MemoryStore::with_clock(clock.clone()))
                }
            },
            None => {
                debug!("no durable store configured, using memory store");
                Arc::new(MemoryStore::with_clock(clock.clone()))
            }
        };

        let quota = QuotaTracker::new(clock.clone(), notifier.clone());
        let mut services = ServiceRegistry::new();
        for pending in self.services {
            let policy = match pending.policy {
                Some(policy) => policy,
                None => self.configured.get(&pending.name).cloned().unwrap_or_else(|| {
                    warn!(service = %pending.name, "no configured policy, using defaults");
                    ServicePolicy::default()
                }),
            };
            let keys = pending.keys.unwrap_or_else(|| policy.keys_from_env());
            let keys = (!keys.is_empty())
                .then(|| KeyPool::new(pending.name.clone(), keys, notifier.clone()));
            quota.register(&pending.name, &policy.rate_limit);
            debug!(
                service = %pending.name,
                adapter = pending.adapter.name(),
                keys = keys.as_ref().map_or(0, KeyPool::len),
                "registered service"
            );
            services.register(ServiceDescriptor {
                name: pending.name,
                adapter: pending.adapter,
                policy,
                keys,
            });
        }
        services.validate()?;
        quota.restore(store.as_ref()).await;

        let cache = AdaptiveCache::new(self.cache, store.clone(), clock.clone());
        info!(services = services.len(), store = store.name(), "orchestrator ready");

        Ok(Orchestrator {
            services,
            quota,
            cache,
            store,
            clock,
            notifier,
            cluster: self.cluster,
            maintenance: self.maintenance,
            failure_alert_threshold: self.failure_alert_threshold,
            metrics: Mutex::new(Default::default()),
            failure_streaks: Mutex::new(HashMap::new()),
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
