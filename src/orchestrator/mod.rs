//! The API orchestrator.
//!
//! Every outbound call goes through [`Orchestrator::execute`]:
//!
//! 1. cache lookup (exact, then nearby for geo-tagged requests);
//! 2. quota reservation before each attempt, which sends the call straight
//!    to the fallback chain when any window is full;
//! 3. adapter call under a per-attempt timeout, retried with jittered
//!    exponential backoff on transient failures;
//! 4. on success, write-through to the cache;
//! 5. on exhaustion, the service's fallback chain, then the original error.
//!
//! Permanent failures (4xx other than 429) skip both retry and fallback.

mod builder;
mod maintenance;
pub mod metrics;

pub use builder::OrchestratorBuilder;
pub use maintenance::{MaintenanceConfig, MaintenanceHandle};
pub use self::metrics::{MetricsSnapshot, MetricsWindow};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use self::metrics::MetricsBook;
use crate::cache::ttl::horizon_from_params;
use crate::cache::{AdaptiveCache, CacheKey, LookupOptions};
use crate::clock::Clock;
use crate::geo::{self, ClusterOptions};
use crate::notify::{Notification, NotificationLevel, Notifier};
use crate::providers::retry::{self, Decision};
use crate::providers::{
    AdapterRequest, FallbackStage, KeyLease, KeyStatus, ServiceDescriptor, ServiceRegistry,
};
use crate::quota::QuotaTracker;
use crate::store::DurableStore;
use crate::telemetry;
use crate::types::{CallOptions, GeoPoint, Outcome, ResponseSource};
use crate::{Result, SkirnirError};

/// Consecutive failed calls to one provider before an error notification.
pub const DEFAULT_FAILURE_ALERT_THRESHOLD: u32 = 5;

/// Resilient front door for all registered services.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Orchestrator {
    services: ServiceRegistry,
    quota: QuotaTracker,
    cache: AdaptiveCache,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    cluster: ClusterOptions,
    maintenance: MaintenanceConfig,
    failure_alert_threshold: u32,
    metrics: Mutex<MetricsBook>,
    failure_streaks: Mutex<HashMap<String, u32>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Call `provider.operation(params)` and return the payload.
    pub async fn execute(
        &self,
        provider: &str,
        operation: &str,
        params: Value,
        options: &CallOptions,
    ) -> Result<Value> {
        self.execute_detailed(provider, operation, params, options)
            .await
            .map(|o| o.payload)
    }

    /// Like [`execute`](Self::execute), also reporting where the payload came from.
    #[instrument(skip(self, params, options))]
    pub async fn execute_detailed(
        &self,
        provider: &str,
        operation: &str,
        params: Value,
        options: &CallOptions,
    ) -> Result<Outcome> {
        self.run(provider, operation, &params, options).await
    }

    /// Execute many geo-tagged requests, sharing one upstream call between
    /// requests that cluster together.
    ///
    /// Results come back in request order. A failed call fails every request
    /// in its cluster; other clusters are unaffected.
    #[instrument(skip(self, requests, options), fields(batch_size = requests.len()))]
    pub async fn execute_batch(
        &self,
        provider: &str,
        operation: &str,
        requests: Vec<Value>,
        options: &CallOptions,
    ) -> Result<Vec<Result<Value>>> {
        let service = self.services.get(provider)?;
        ensure_operation(service, operation)?;

        let batch = geo::optimize_requests(&requests, &self.cluster);
        let saved = batch.calls_saved();
        if saved > 0 {
            ::metrics::counter!(telemetry::GEO_CALLS_SAVED_TOTAL,
                "provider" => provider.to_owned(),
                "operation" => operation.to_owned(),
            )
            .increment(saved as u64);
        }
        debug!(provider, operation, upstream_calls = batch.optimized_requests.len(), saved, "batch planned");

        // Each request carries its own coordinates.
        let options = CallOptions {
            geo: None,
            ..options.clone()
        };
        let responses = join_all(
            batch
                .optimized_requests
                .iter()
                .map(|params| self.run(provider, operation, params, &options)),
        )
        .await
        .into_iter()
        .map(|r| r.map(|o| o.payload))
        .collect::<Vec<_>>();
        geo::reconstruct(&responses, &batch.mapping)
    }

    /// Whether a call of `cost` units to `provider` would pass the quota check now.
    pub fn can_make_request(&self, provider: &str, cost: u32) -> bool {
        self.services.contains(provider) && self.quota.can_proceed(provider, cost)
    }

    /// Rolling statistics for one provider, or globally with `None`.
    pub fn service_metrics(&self, provider: Option<&str>) -> MetricsSnapshot {
        self.metrics_book().snapshot(provider)
    }

    /// Clear statistics for one provider, or everything with `None`.
    pub fn reset_metrics(&self, provider: Option<&str>) {
        self.metrics_book().reset(provider);
    }

    /// Credential health for a provider. Empty if it has no key pool.
    pub fn key_status(&self, provider: &str) -> Result<Vec<KeyStatus>> {
        let service = self.services.get(provider)?;
        Ok(service.keys.as_ref().map(|p| p.status()).unwrap_or_default())
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn cache(&self) -> &AdaptiveCache {
        &self.cache
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    /// Rotate every key pool; resets pools whose keys are all inactive.
    pub fn sweep_keys(&self) {
        for service in self.services.iter() {
            if let Some(pool) = &service.keys {
                pool.sweep();
            }
        }
    }

    /// Write quota state to the durable store if it changed.
    pub async fn persist_quota(&self) -> Result<()> {
        self.quota.persist(self.store.as_ref()).await
    }

    /// Final persistence before the process exits.
    pub async fn shutdown(&self) -> Result<()> {
        info!("orchestrator shutting down");
        self.persist_quota().await
    }

    // ========================================================================
    // Call path
    // ========================================================================

    /// Boxed so the backup-provider stage can re-enter it.
    fn run<'a>(
        &'a self,
        provider: &'a str,
        operation: &'a str,
        params: &'a Value,
        options: &'a CallOptions,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            let service = self.services.get(provider)?;
            ensure_operation(service, operation)?;
            let result = self.serve(service, operation, params, options).await;
            self.record_outcome(provider, operation, &result);
            result
        }
        .boxed()
    }

    async fn serve(
        &self,
        service: &ServiceDescriptor,
        operation: &str,
        params: &Value,
        options: &CallOptions,
    ) -> Result<Outcome> {
        let policy = &service.policy;
        let key = self.cache.key_for(&service.name, operation, params);
        let lookup = LookupOptions {
            policy: &policy.cache.ttl,
            data_type: options.data_type.unwrap_or(policy.cache.data_type),
            geo: options.geo.or_else(|| GeoPoint::from_params(params)),
            severe: options.severe,
            horizon_hours: options.horizon_hours.or_else(|| horizon_from_params(params)),
        };
        let network = || self.call_network(service, operation, params, options.cost);

        let result = if policy.cache.enabled && !options.bypass_cache {
            self.cache.resolve(&key, &lookup, network).await.map(|r| {
                let source = match r.tier {
                    Some(_) => ResponseSource::Cache,
                    None => ResponseSource::Network,
                };
                Outcome::new(r.payload, source)
            })
        } else {
            network()
                .await
                .map(|payload| Outcome::new(payload, ResponseSource::Network))
        };

        let error = match result {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };
        // Retries are already spent at this point; ask only fallback-or-throw.
        let decision = retry::decide(&error, policy.retry.max_retries, &policy.retry, 1.0);
        if options.disable_fallback || decision != Decision::Fallback {
            return Err(error);
        }
        self.fallback(service, operation, params, options, &key, error)
            .await
    }

    /// Attempt the adapter call under the service's retry policy.
    async fn call_network(
        &self,
        service: &ServiceDescriptor,
        operation: &str,
        params: &Value,
        cost: u32,
    ) -> Result<Value> {
        let provider = service.name.as_str();
        let policy = &service.policy;
        let timeout = policy.attempt_timeout();
        let mut attempt = 0u32;

        loop {
            if let Err(e) = self.quota.try_reserve(provider, cost) {
                if let SkirnirError::RateLimitExceeded { window, .. } = &e {
                    ::metrics::counter!(telemetry::QUOTA_REJECTIONS_TOTAL,
                        "provider" => provider.to_owned(),
                        "window" => window.clone(),
                    )
                    .increment(1);
                }
                self.update_metrics(provider, |w| w.record_quota_rejection());
                debug!(provider, operation, error = %e, "quota exhausted, network not touched");
                return Err(e);
            }

            let lease = service
                .keys
                .as_ref()
                .and_then(|pool| pool.acquire(self.clock.now()));
            let request = AdapterRequest {
                operation,
                params,
                credential: lease.as_ref().map(KeyLease::expose),
            };

            let start = Instant::now();
            let result = match tokio::time::timeout(timeout, service.adapter.invoke(request)).await
            {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(err)) => {
                    if err.is_auth_failure()
                        && let (Some(pool), Some(lease)) = (&service.keys, &lease)
                    {
                        pool.report_auth_failure(lease);
                    }
                    Err(SkirnirError::from_provider(provider, operation, params, err))
                }
                Err(_) => Err(SkirnirError::Timeout {
                    provider: provider.to_owned(),
                    operation: operation.to_owned(),
                    after: timeout,
                }),
            };
            let elapsed = start.elapsed();
            let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
            // Units were charged by `try_reserve`; providers meter attempts.
            self.quota
                .record_outcome(provider, cost, result.is_ok(), elapsed_ms);

            let error = match result {
                Ok(payload) => {
                    if let (Some(pool), Some(lease)) = (&service.keys, &lease) {
                        pool.report_success(lease);
                    }
                    ::metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
                        "provider" => provider.to_owned(),
                        "operation" => operation.to_owned(),
                    )
                    .record(elapsed.as_secs_f64());
                    self.update_metrics(provider, |w| w.record_response_time(elapsed_ms));
                    self.note_success(provider);
                    return Ok(payload);
                }
                Err(e) => e,
            };

            match retry::decide(&error, attempt, &policy.retry, policy.retry.sample_jitter()) {
                Decision::Retry { delay } => {
                    warn!(
                        provider,
                        operation,
                        attempt = attempt + 1,
                        max_attempts = policy.retry.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after transient error"
                    );
                    ::metrics::counter!(telemetry::RETRIES_TOTAL,
                        "provider" => provider.to_owned(),
                        "operation" => operation.to_owned(),
                    )
                    .increment(1);
                    self.update_metrics(provider, |w| w.record_retry());
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Decision::Fallback | Decision::Throw => {
                    self.note_failure(provider, &error);
                    return Err(error);
                }
            }
        }
    }

    /// Try each fallback stage in order; the first payload wins.
    async fn fallback(
        &self,
        service: &ServiceDescriptor,
        operation: &str,
        params: &Value,
        options: &CallOptions,
        key: &CacheKey,
        error: SkirnirError,
    ) -> Result<Outcome> {
        for stage in &service.policy.fallback.stages {
            let outcome = match stage {
                FallbackStage::StaleCache => {
                    if !service.policy.cache.enabled {
                        continue;
                    }
                    self.cache
                        .get_stale(key)
                        .await
                        .map(|payload| Outcome::new(payload, ResponseSource::StaleCache))
                }
                FallbackStage::Static { payload } => {
                    Some(Outcome::new(payload.clone(), ResponseSource::Static))
                }
                FallbackStage::BackupProvider { provider } => {
                    let backup_options = CallOptions {
                        disable_fallback: true,
                        ..options.clone()
                    };
                    match self.run(provider, operation, params, &backup_options).await {
                        Ok(o) => Some(Outcome::new(
                            o.payload,
                            ResponseSource::Backup(provider.clone()),
                        )),
                        Err(e) => {
                            warn!(service = %service.name, backup = %provider, error = %e, "backup provider failed");
                            None
                        }
                    }
                }
            };
            if let Some(outcome) = outcome {
                info!(
                    provider = %service.name,
                    operation,
                    source = outcome.source.as_str(),
                    error = %error,
                    "served by fallback"
                );
                ::metrics::counter!(telemetry::FALLBACKS_TOTAL,
                    "provider" => service.name.clone(),
                    "source" => outcome.source.as_str(),
                )
                .increment(1);
                return Ok(outcome);
            }
        }
        Err(error)
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    fn record_outcome(&self, provider: &str, operation: &str, result: &Result<Outcome>) {
        let status = if result.is_ok() { "ok" } else { "error" };
        ::metrics::counter!(telemetry::REQUESTS_TOTAL,
            "provider" => provider.to_owned(),
            "operation" => operation.to_owned(),
            "status" => status,
        )
        .increment(1);
        self.update_metrics(provider, |w| match result {
            Ok(outcome) => {
                w.record_success();
                if outcome.source == ResponseSource::Cache {
                    w.record_cache_hit();
                }
                if outcome.source.is_fallback() {
                    w.record_fallback();
                }
            }
            Err(_) => w.record_failure(),
        });
    }

    fn update_metrics(&self, provider: &str, f: impl Fn(&mut MetricsWindow)) {
        self.metrics_book().update(provider, f);
    }

    fn metrics_book(&self) -> MutexGuard<'_, MetricsBook> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn note_failure(&self, provider: &str, error: &SkirnirError) {
        let streak = {
            let mut streaks = self.failure_streaks.lock().unwrap_or_else(|e| e.into_inner());
            let streak = streaks.entry(provider.to_owned()).or_insert(0);
            *streak += 1;
            *streak
        };
        if streak == self.failure_alert_threshold {
            self.notifier.notify(Notification::new(
                NotificationLevel::Error,
                "orchestrator",
                provider,
                format!("{streak} consecutive failures; last: {error}"),
            ));
        }
    }

    fn note_success(&self, provider: &str) {
        let previous = self
            .failure_streaks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(provider)
            .unwrap_or(0);
        if previous >= self.failure_alert_threshold {
            self.notifier.notify(Notification::new(
                NotificationLevel::Info,
                "orchestrator",
                provider,
                format!("recovered after {previous} consecutive failures"),
            ));
        }
    }
}

fn ensure_operation(service: &ServiceDescriptor, operation: &str) -> Result<()> {
    if service.adapter.supports(operation) {
        Ok(())
    } else {
        Err(SkirnirError::OperationNotFound {
            provider: service.name.clone(),
            operation: operation.to_owned(),
        })
    }
}
