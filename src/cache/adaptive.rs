//! Two-tier response cache.
//!
//! The volatile tier is a bounded moka cache local to the process. The
//! durable tier lives in a [`DurableStore`] and holds entries that were hit
//! often enough to be worth keeping, plus every geo-anchored entry so nearby
//! requests can find it with a radius query.
//!
//! Freshness is always judged against the injected [`Clock`]. Entries stay
//! physically present for `stale_retention` past their expiry so the
//! fallback chain can still serve them via [`AdaptiveCache::get_stale`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::Expiry;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::key::{CacheKey, content_hash, default_volatile_params};
use super::ttl::{TtlContext, TtlPolicy, payload_signals_severe};
use crate::Result;
use crate::clock::{self, Clock};
use crate::store::DurableStore;
use crate::telemetry;
use crate::types::{DataType, GeoPoint};

const DURABLE_PREFIX: &str = "skirnir:cache:";
const GEO_PREFIX: &str = "skirnir:geo:";
/// Upper bound on candidates examined by one proximity lookup.
const MAX_GEO_CANDIDATES: usize = 1_024;

/// Configuration for the adaptive cache.
///
/// ```rust
/// # use skirnir::cache::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(5_000)
///     .promotion_threshold(2)
///     .stale_retention(Duration::from_secs(6 * 3600));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Capacity of the volatile tier. Default: 10,000.
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    /// Volatile hits before an entry is written to the durable tier. Default: 3.
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: u32,
    /// How long expired entries remain available as stale. Default: 24 hours.
    #[serde(default = "default_stale_retention_secs")]
    pub stale_retention_secs: u64,
    /// Candidates fetched per proximity query. Default: 16.
    #[serde(default = "default_geo_search_limit")]
    pub geo_search_limit: usize,
    /// Param names excluded from cache keys.
    #[serde(default = "default_volatile_params")]
    pub volatile_params: Vec<String>,
}

fn default_max_entries() -> u64 {
    10_000
}

fn default_promotion_threshold() -> u32 {
    3
}

fn default_stale_retention_secs() -> u64 {
    24 * 3600
}

fn default_geo_search_limit() -> usize {
    16
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            promotion_threshold: default_promotion_threshold(),
            stale_retention_secs: default_stale_retention_secs(),
            geo_search_limit: default_geo_search_limit(),
            volatile_params: default_volatile_params(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    pub fn promotion_threshold(mut self, hits: u32) -> Self {
        self.promotion_threshold = hits.max(1);
        self
    }

    pub fn stale_retention(mut self, retention: Duration) -> Self {
        self.stale_retention_secs = retention.as_secs();
        self
    }

    /// Add a param name to exclude from cache keys.
    pub fn volatile_param(mut self, name: impl Into<String>) -> Self {
        self.volatile_params.push(name.into());
        self
    }

    pub fn stale_retention_duration(&self) -> Duration {
        Duration::from_secs(self.stale_retention_secs)
    }
}

/// A cached payload and its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u32,
    /// Location the payload describes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoPoint>,
    pub content_hash: String,
    pub data_type: DataType,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Whether the entry may still be served as stale.
    pub fn is_retained(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        now <= clock::after(self.expires_at, retention)
    }
}

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Volatile,
    Durable,
    /// A different but nearby request's result.
    Geo,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Volatile => "volatile",
            CacheTier::Durable => "durable",
            CacheTier::Geo => "geo",
        }
    }
}

/// Per-call lookup context.
#[derive(Debug, Clone, Copy)]
pub struct LookupOptions<'a> {
    pub policy: &'a TtlPolicy,
    pub data_type: DataType,
    /// Anchor for proximity reuse.
    pub geo: Option<GeoPoint>,
    pub severe: bool,
    pub horizon_hours: Option<u32>,
}

/// Result of [`AdaptiveCache::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub payload: Value,
    /// `None` when the payload was just fetched.
    pub tier: Option<CacheTier>,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub volatile_hits: u64,
    pub durable_hits: u64,
    pub geo_hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub stale_hits: u64,
    /// Approximate number of entries in the volatile tier.
    pub entries: u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.volatile_hits + self.durable_hits + self.geo_hits
    }
}

#[derive(Default)]
struct Counters {
    volatile_hits: AtomicU64,
    durable_hits: AtomicU64,
    geo_hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    stale_hits: AtomicU64,
}

struct VolatileEntry {
    entry: CacheEntry,
    geo_scope: String,
    lifetime: Duration,
    hits: AtomicU32,
    promoted: AtomicBool,
}

struct VolatileExpiry {
    retention: Duration,
}

impl Expiry<String, Arc<VolatileEntry>> for VolatileExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<VolatileEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.lifetime.saturating_add(self.retention))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<VolatileEntry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.lifetime.saturating_add(self.retention))
    }
}

/// Outcome of an in-flight fetch, `None` until it completes.
type FlightOutcome = watch::Receiver<Option<Result<Value>>>;

enum Flight<'a> {
    Leader(FlightGuard<'a>),
    Follower(FlightOutcome),
}

/// Held by the caller performing a fetch. Dropping it unregisters the
/// flight; followers of an unpublished flight retry on their own.
struct FlightGuard<'a> {
    cache: &'a AdaptiveCache,
    key: String,
    id: u64,
    tx: watch::Sender<Option<Result<Value>>>,
}

impl FlightGuard<'_> {
    fn publish(self, result: Result<Value>) {
        self.tx.send_replace(Some(result));
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self
            .cache
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if in_flight.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

/// Response cache with dynamic TTLs and geo-proximity reuse.
pub struct AdaptiveCache {
    volatile: Cache<String, Arc<VolatileEntry>>,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    counters: Counters,
    in_flight: Mutex<HashMap<String, (u64, FlightOutcome)>>,
    next_flight: AtomicU64,
}

impl AdaptiveCache {
    pub fn new(config: CacheConfig, store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        let volatile = Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(VolatileExpiry {
                retention: config.stale_retention_duration(),
            })
            .build();
        Self {
            volatile,
            store,
            clock,
            config,
            counters: Counters::default(),
            in_flight: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key for a request, honouring the configured volatile params.
    pub fn key_for(&self, provider: &str, operation: &str, params: &Value) -> CacheKey {
        CacheKey::new(provider, operation, params, &self.config.volatile_params)
    }

    /// Fresh payload for `key`, from whichever tier has one.
    pub async fn get(&self, key: &CacheKey, opts: &LookupOptions<'_>) -> Option<Value> {
        match self.lookup(key, opts).await {
            Some((payload, tier)) => {
                self.record_hit(tier);
                Some(payload)
            }
            None => {
                self.record_miss();
                None
            }
        }
    }

    /// Store a freshly fetched payload. Returns the entry as written.
    pub async fn insert(
        &self,
        key: &CacheKey,
        payload: Value,
        opts: &LookupOptions<'_>,
    ) -> CacheEntry {
        let now = self.clock.now();
        let lifetime = opts.policy.ttl_for(&TtlContext {
            data_type: opts.data_type,
            at: now,
            severe: opts.severe || payload_signals_severe(&payload),
            horizon_hours: opts.horizon_hours,
        });
        let geo = opts
            .geo
            .filter(|p| p.is_valid() && opts.policy.reuse_radius_for(opts.data_type).is_some());
        let entry = CacheEntry {
            key: key.key.clone(),
            content_hash: content_hash(&payload),
            payload,
            created_at: now,
            expires_at: clock::after(now, lifetime),
            access_count: 0,
            geo,
            data_type: opts.data_type,
        };
        debug!(key = %key, ttl_secs = lifetime.as_secs(), geo = geo.is_some(), "cache insert");

        // Geo-anchored entries go straight to the durable tier so that
        // proximity queries can see them.
        let promoted = geo.is_some() && self.persist(&entry, &key.geo_scope).await;
        let cached = Arc::new(VolatileEntry {
            entry: entry.clone(),
            geo_scope: key.geo_scope.clone(),
            lifetime,
            hits: AtomicU32::new(0),
            promoted: AtomicBool::new(promoted),
        });
        self.volatile.insert(key.key.clone(), cached).await;
        entry
    }

    /// Payload for `key` even if expired, within the stale retention period.
    pub async fn get_stale(&self, key: &CacheKey) -> Option<Value> {
        let now = self.clock.now();
        let retention = self.config.stale_retention_duration();
        if let Some(cached) = self.volatile.get(&key.key).await
            && cached.entry.is_retained(now, retention)
        {
            self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
            return Some(cached.entry.payload.clone());
        }
        let entry = self.load_durable(&key.key).await?;
        if !entry.is_retained(now, retention) {
            return None;
        }
        self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.payload)
    }

    /// Cached payload or the result of `fetch`, stored on success.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &CacheKey,
        opts: &LookupOptions<'_>,
        fetch: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        self.resolve(key, opts, fetch).await.map(|r| r.payload)
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch), also reporting the tier.
    ///
    /// Concurrent misses on the same key join the first caller's fetch and
    /// receive its outcome, error included. Followers of a successful fetch
    /// count as volatile hits. If the leading caller is dropped before it
    /// finishes, a follower takes over.
    pub async fn resolve<F, Fut>(
        &self,
        key: &CacheKey,
        opts: &LookupOptions<'_>,
        fetch: F,
    ) -> Result<Resolved>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        loop {
            if let Some((payload, tier)) = self.lookup(key, opts).await {
                self.record_hit(tier);
                return Ok(Resolved {
                    payload,
                    tier: Some(tier),
                });
            }

            let mut outcome = match self.join_flight(&key.key) {
                Flight::Leader(flight) => return self.lead(key, opts, flight, fetch).await,
                Flight::Follower(outcome) => outcome,
            };
            let shared = outcome
                .wait_for(Option::is_some)
                .await
                .map(|done| done.clone())
                .ok()
                .flatten();
            match shared {
                Some(Ok(payload)) => {
                    trace!(key = %key, "joined in-flight fetch");
                    self.record_hit(CacheTier::Volatile);
                    return Ok(Resolved {
                        payload,
                        tier: Some(CacheTier::Volatile),
                    });
                }
                Some(Err(e)) => return Err(e),
                None => debug!(key = %key, "in-flight fetch abandoned, retrying"),
            }
        }
    }

    async fn lead<F, Fut>(
        &self,
        key: &CacheKey,
        opts: &LookupOptions<'_>,
        flight: FlightGuard<'_>,
        fetch: F,
    ) -> Result<Resolved>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        // A flight that finished between our lookup and joining has
        // already filled the cache.
        if let Some((payload, tier)) = self.lookup(key, opts).await {
            self.record_hit(tier);
            return Ok(Resolved {
                payload,
                tier: Some(tier),
            });
        }
        self.record_miss();

        let result = fetch().await;
        if let Ok(payload) = &result {
            self.insert(key, payload.clone(), opts).await;
        }
        flight.publish(result.clone());

        result.map(|payload| Resolved {
            payload,
            tier: None,
        })
    }

    /// Drop `key` from both tiers.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        self.volatile.invalidate(&key.key).await;
        self.store.delete(&durable_key(&key.key)).await
    }

    /// Empty the volatile tier. Durable entries age out on their own TTL.
    pub fn clear(&self) {
        self.volatile.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            volatile_hits: c.volatile_hits.load(Ordering::Relaxed),
            durable_hits: c.durable_hits.load(Ordering::Relaxed),
            geo_hits: c.geo_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            promotions: c.promotions.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            entries: self.volatile.entry_count(),
        }
    }

    async fn lookup(&self, key: &CacheKey, opts: &LookupOptions<'_>) -> Option<(Value, CacheTier)> {
        let now = self.clock.now();

        if let Some(cached) = self.volatile.get(&key.key).await
            && cached.entry.is_fresh(now)
        {
            self.count_volatile_hit(&cached).await;
            return Some((cached.entry.payload.clone(), CacheTier::Volatile));
        }

        if let Some(entry) = self.load_durable(&key.key).await
            && entry.is_fresh(now)
        {
            let payload = entry.payload.clone();
            self.rewarm(entry, key, now).await;
            return Some((payload, CacheTier::Durable));
        }

        let point = opts.geo.filter(GeoPoint::is_valid)?;
        let radius = opts.policy.reuse_radius_for(opts.data_type)?;
        self.nearby(&key.geo_scope, point, radius, now)
            .await
            .map(|payload| (payload, CacheTier::Geo))
    }

    /// Most recent fresh entry within `radius_km` of `point` in `scope`.
    ///
    /// Durable entries outlive their freshness by the stale retention, so the
    /// nearest candidates may all be stale. The search widens until a fresh
    /// one turns up, the radius is exhausted, or `MAX_GEO_CANDIDATES` is hit.
    async fn nearby(
        &self,
        scope: &str,
        point: GeoPoint,
        radius_km: f64,
        now: DateTime<Utc>,
    ) -> Option<Value> {
        let namespace = geo_namespace(scope);
        let mut limit = self.config.geo_search_limit.clamp(1, MAX_GEO_CANDIDATES);
        loop {
            let hits = match self.store.nearest(&namespace, point, radius_km, limit).await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(store = self.store.name(), error = %e, "proximity query failed");
                    return None;
                }
            };
            let exhausted = hits.len() < limit;

            let mut best: Option<CacheEntry> = None;
            for hit in hits {
                let Some(entry) = self.load_durable_raw(&hit.member).await else {
                    continue;
                };
                if !entry.is_fresh(now) {
                    continue;
                }
                if best.as_ref().is_none_or(|b| entry.created_at > b.created_at) {
                    trace!(member = %hit.member, distance_km = hit.distance_km, "proximity candidate");
                    best = Some(entry);
                }
            }
            if best.is_some() || exhausted || limit >= MAX_GEO_CANDIDATES {
                return best.map(|e| e.payload);
            }
            limit = limit.saturating_mul(4).min(MAX_GEO_CANDIDATES);
            trace!(scope, limit, "only stale candidates nearby, widening search");
        }
    }

    async fn count_volatile_hit(&self, cached: &Arc<VolatileEntry>) {
        let hits = cached.hits.fetch_add(1, Ordering::Relaxed) + 1;
        if hits < self.config.promotion_threshold || cached.promoted.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut entry = cached.entry.clone();
        entry.access_count = hits;
        if self.persist(&entry, &cached.geo_scope).await {
            self.counters.promotions.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(telemetry::CACHE_PROMOTIONS_TOTAL).increment(1);
            debug!(key = %entry.key, hits, "promoted to durable tier");
        } else {
            cached.promoted.store(false, Ordering::Release);
        }
    }

    /// Put a durable entry back into the volatile tier.
    async fn rewarm(&self, entry: CacheEntry, key: &CacheKey, now: DateTime<Utc>) {
        let lifetime = clock::elapsed(now, entry.expires_at);
        let cached = Arc::new(VolatileEntry {
            entry,
            geo_scope: key.geo_scope.clone(),
            lifetime,
            hits: AtomicU32::new(0),
            promoted: AtomicBool::new(true),
        });
        self.volatile.insert(key.key.clone(), cached).await;
    }

    /// Write `entry` to the durable tier. Returns whether it succeeded.
    async fn persist(&self, entry: &CacheEntry, geo_scope: &str) -> bool {
        let now = self.clock.now();
        let ttl = clock::elapsed(now, entry.expires_at)
            .saturating_add(self.config.stale_retention_duration());
        let member = durable_key(&entry.key);
        let value = match serde_json::to_value(entry) {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "cache entry not serialisable");
                return false;
            }
        };
        if let Err(e) = self.store.set(&member, value, Some(ttl)).await {
            warn!(store = self.store.name(), key = %entry.key, error = %e, "durable cache write failed");
            return false;
        }
        if let Some(point) = entry.geo
            && let Err(e) = self
                .store
                .index_geo(&geo_namespace(geo_scope), &member, point)
                .await
        {
            warn!(store = self.store.name(), key = %entry.key, error = %e, "geo index write failed");
        }
        true
    }

    async fn load_durable(&self, key: &str) -> Option<CacheEntry> {
        self.load_durable_raw(&durable_key(key)).await
    }

    async fn load_durable_raw(&self, durable_key: &str) -> Option<CacheEntry> {
        match self.store.get(durable_key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(key = durable_key, error = %e, "discarding corrupt cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(store = self.store.name(), key = durable_key, error = %e, "durable cache read failed");
                None
            }
        }
    }

    fn join_flight(&self, key: &str) -> Flight<'_> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, outcome)) = in_flight.get(key) {
            return Flight::Follower(outcome.clone());
        }
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        in_flight.insert(key.to_owned(), (id, rx));
        Flight::Leader(FlightGuard {
            cache: self,
            key: key.to_owned(),
            id,
            tx,
        })
    }

    fn record_hit(&self, tier: CacheTier) {
        let counter = match tier {
            CacheTier::Volatile => &self.counters.volatile_hits,
            CacheTier::Durable => &self.counters.durable_hits,
            CacheTier::Geo => &self.counters.geo_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => tier.as_str()).increment(1);
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
    }
}

fn durable_key(key: &str) -> String {
    format!("{DURABLE_PREFIX}{key}")
}

fn geo_namespace(scope: &str) -> String {
    format!("{GEO_PREFIX}{scope}")
}
