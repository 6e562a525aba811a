use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::trace;

use super::{DurableStore, GeoHit};
use crate::Result;
use crate::clock::{self, Clock, SystemClock};
use crate::types::GeoPoint;

struct StoredValue {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory implementation of [`DurableStore`].
///
/// Not durable across restarts; it exists so the rest of the system can
/// run unchanged without an external store.
pub struct MemoryStore {
    values: RwLock<HashMap<String, StoredValue>>,
    geo: RwLock<HashMap<String, HashMap<String, GeoPoint>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Expire entries against the given clock instead of the system clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            geo: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live (unexpired) values.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        self.values
            .read()
            .await
            .values()
            .filter(|v| v.expires_at.is_none_or(|at| at > now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = self.clock.now();
        let values = self.values.read().await;
        Ok(values
            .get(key)
            .filter(|v| v.expires_at.is_none_or(|at| at > now))
            .map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| clock::after(self.clock.now(), ttl));
        trace!(key, ?expires_at, "MemoryStore::set");
        let now = self.clock.now();
        let mut swept = Vec::new();
        {
            let mut values = self.values.write().await;
            // Opportunistic sweep so long-running processes don't accumulate garbage.
            values.retain(|k, v| {
                let live = v.expires_at.is_none_or(|at| at > now);
                if !live {
                    swept.push(k.clone());
                }
                live
            });
            values.insert(key.to_owned(), StoredValue { value, expires_at });
        }
        if !swept.is_empty() {
            let mut geo = self.geo.write().await;
            for index in geo.values_mut() {
                for member in &swept {
                    index.remove(member);
                }
            }
            geo.retain(|_, index| !index.is_empty());
            trace!(swept = swept.len(), "MemoryStore swept expired values");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        for index in self.geo.write().await.values_mut() {
            index.remove(key);
        }
        Ok(())
    }

    async fn index_geo(&self, namespace: &str, member: &str, point: GeoPoint) -> Result<()> {
        self.geo
            .write()
            .await
            .entry(namespace.to_owned())
            .or_default()
            .insert(member.to_owned(), point);
        Ok(())
    }

    async fn nearest(
        &self,
        namespace: &str,
        point: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<GeoHit>> {
        let now = self.clock.now();
        // Lock order is values then geo, matching `set`.
        let values = self.values.read().await;
        let geo = self.geo.read().await;
        let Some(index) = geo.get(namespace) else {
            return Ok(Vec::new());
        };
        let expired = |member: &str| {
            values
                .get(member)
                .is_some_and(|v| v.expires_at.is_some_and(|at| at <= now))
        };
        let mut hits: Vec<GeoHit> = index
            .iter()
            .filter(|(member, _)| !expired(member.as_str()))
            .filter_map(|(member, p)| {
                let distance_km = point.haversine_km(p);
                (distance_km <= radius_km).then(|| GeoHit {
                    member: member.clone(),
                    point: *p,
                    distance_km,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.member.cmp(&b.member))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn values_expire_by_clock() {
        let clock = clock();
        let store = MemoryStore::with_clock(clock.clone());
        store
            .set("k", json!(1), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
        clock.advance(Duration::from_secs(11));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn nearest_orders_by_distance_and_respects_radius() {
        let store = MemoryStore::new();
        store.index_geo("ns", "far", GeoPoint::new(46.5, 7.0)).await.unwrap();
        store.index_geo("ns", "near", GeoPoint::new(46.01, 7.0)).await.unwrap();
        store.index_geo("ns", "here", GeoPoint::new(46.0, 7.0)).await.unwrap();

        let hits = store
            .nearest("ns", GeoPoint::new(46.0, 7.0), 10.0, 10)
            .await
            .unwrap();
        let names: Vec<&str> = hits.iter().map(|h| h.member.as_str()).collect();
        assert_eq!(names, vec!["here", "near"]);
    }

    #[tokio::test]
    async fn expired_values_leave_the_geo_index() {
        let clock = clock();
        let store = MemoryStore::with_clock(clock.clone());
        let here = GeoPoint::new(46.0, 7.0);
        store
            .set("old", json!(1), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        store.index_geo("ns", "old", here).await.unwrap();
        clock.advance(Duration::from_secs(11));

        // Hidden from queries as soon as the value expires.
        assert!(store.nearest("ns", here, 1.0, 10).await.unwrap().is_empty());

        // Dropped from the index by the next sweep.
        store.set("new", json!(2), None).await.unwrap();
        store.index_geo("ns", "new", here).await.unwrap();
        let index = store.geo.read().await;
        assert_eq!(index["ns"].len(), 1);
        assert!(index["ns"].contains_key("new"));
    }

    #[tokio::test]
    async fn delete_drops_geo_membership() {
        let store = MemoryStore::new();
        store.set("k", json!("v"), None).await.unwrap();
        store.index_geo("ns", "k", GeoPoint::new(0.0, 0.0)).await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(
            store
                .nearest("ns", GeoPoint::new(0.0, 0.0), 1.0, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
