//! Durable key-value store collaborator.
//!
//! The quota tracker persists its counters here and the adaptive cache
//! keeps its durable tier here. Any engine that can do keyed get/set with
//! an optional TTL plus a radius query over indexed points will do (Redis
//! with `GEOSEARCH`, Postgres with PostGIS, ...). [`MemoryStore`] is the
//! in-process implementation used when nothing else is configured and as
//! the memory-only fallback when the configured store is unreachable.

mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;
use crate::types::GeoPoint;

/// One result of a [`DurableStore::nearest`] query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoHit {
    /// Member name that was indexed (for the cache, the entry key).
    pub member: String,
    pub point: GeoPoint,
    pub distance_km: f64,
}

/// Generic durable storage.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Store name for logging/debugging.
    fn name(&self) -> &str;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Insert or overwrite. `ttl: None` keeps the value until deleted.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Add or move `member` in the geo index `namespace`.
    async fn index_geo(&self, namespace: &str, member: &str, point: GeoPoint) -> Result<()>;

    /// Members of `namespace` within `radius_km` of `point`, nearest first.
    async fn nearest(
        &self,
        namespace: &str,
        point: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<GeoHit>>;
}
