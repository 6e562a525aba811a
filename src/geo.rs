//! Geo-clustering of batched location requests.
//!
//! A batch of requests for the same provider operation often targets points
//! a few kilometres apart (e.g. every waypoint of a ride). Weather at those
//! points is indistinguishable at provider resolution, so the batch is
//! partitioned into clusters and only each cluster's centroid is fetched.
//!
//! # Algorithm
//!
//! DBSCAN over haversine distance. A point with at least `min_points`
//! neighbours (itself included) within `radius_km` seeds a cluster; points
//! that never join one become singleton clusters. If more than
//! `max_clusters` clusters result, the smallest are merged into a single
//! overflow cluster.
//!
//! Centroids average the members on the unit sphere (3-D Cartesian mean,
//! projected back), which stays correct across the date line and near the
//! poles where a naive lat/lon mean does not.
//!
//! # Determinism
//!
//! Points are visited in input order and clusters are returned ordered by
//! their lowest member index. Ties when choosing which clusters to merge
//! into the overflow cluster keep the cluster with the lower first member.
//!
//! # Failure policy
//!
//! Clustering is an optimisation. Any internal failure (non-finite or
//! out-of-range coordinates) degrades to one cluster per point instead of
//! failing the batch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::types::GeoPoint;
use crate::{Result, SkirnirError};

/// Clustering parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterOptions {
    /// Neighbourhood radius in kilometres. Default: 25.
    #[serde(default = "default_radius_km")]
    pub radius_km: f64,
    /// Minimum points (including the point itself) to seed a cluster. Default: 2.
    #[serde(default = "default_min_points")]
    pub min_points: usize,
    /// Upper bound on clusters; extras merge into one overflow cluster. Default: 10.
    #[serde(default = "default_max_clusters")]
    pub max_clusters: usize,
}

fn default_radius_km() -> f64 {
    25.0
}

fn default_min_points() -> usize {
    2
}

fn default_max_clusters() -> usize {
    10
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            radius_km: default_radius_km(),
            min_points: default_min_points(),
            max_clusters: default_max_clusters(),
        }
    }
}

impl ClusterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn radius_km(mut self, radius_km: f64) -> Self {
        self.radius_km = radius_km;
        self
    }

    pub fn min_points(mut self, n: usize) -> Self {
        self.min_points = n;
        self
    }

    pub fn max_clusters(mut self, n: usize) -> Self {
        self.max_clusters = n;
        self
    }
}

/// A group of proximate points served by one upstream call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCluster {
    /// Spherical mean of the members.
    pub centroid: GeoPoint,
    /// Indices into the input slice, ascending.
    pub members: Vec<usize>,
    /// Largest member distance from the centroid, in kilometres.
    pub radius_km: f64,
}

/// Result of [`optimize_requests`].
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizedBatch {
    /// One params object per upstream call.
    pub optimized_requests: Vec<Value>,
    /// `mapping[i]` is the index in `optimized_requests` that answers original request `i`.
    pub mapping: Vec<usize>,
}

impl OptimizedBatch {
    /// Upstream calls avoided compared to one call per request.
    pub fn calls_saved(&self) -> usize {
        self.mapping.len() - self.optimized_requests.len()
    }
}

/// Partition `points` into clusters.
///
/// Never fails; see the module docs for the degradation rule.
pub fn cluster(points: &[GeoPoint], options: &ClusterOptions) -> Vec<RequestCluster> {
    match try_cluster(points, options) {
        Ok(clusters) => clusters,
        Err(e) => {
            warn!(error = %e, points = points.len(), "geo clustering failed, using one cluster per point");
            singletons(points)
        }
    }
}

/// Whether `point` is close enough to `anchor` to reuse its result.
pub fn within_reuse_radius(anchor: &GeoPoint, point: &GeoPoint, reuse_radius_km: f64) -> bool {
    anchor.haversine_km(point) <= reuse_radius_km
}

/// Spherical centroid of a set of points.
///
/// Returns `None` for an empty set or antipodal points whose mean vector
/// vanishes.
pub fn spherical_centroid(points: &[GeoPoint]) -> Option<GeoPoint> {
    if points.is_empty() {
        return None;
    }
    let mut sum = [0.0_f64; 3];
    for p in points {
        let c = p.to_cartesian();
        sum[0] += c[0];
        sum[1] += c[1];
        sum[2] += c[2];
    }
    let n = points.len() as f64;
    let mean = [sum[0] / n, sum[1] / n, sum[2] / n];
    if mean.iter().map(|v| v * v).sum::<f64>() < 1e-18 {
        return None;
    }
    GeoPoint::from_cartesian(mean)
}

/// Collapse geo-tagged request params into one request per cluster.
///
/// Requests are first grouped by their non-coordinate params (two requests
/// asking for different units never share a call), then clustered within
/// each group. A cluster's request is its first member's params with the
/// centroid written in; singletons keep their params unchanged. Requests
/// without usable coordinates pass through untouched.
pub fn optimize_requests(requests: &[Value], options: &ClusterOptions) -> OptimizedBatch {
    // Group key -> (request index, point)
    let mut groups: BTreeMap<String, Vec<(usize, GeoPoint)>> = BTreeMap::new();
    let mut passthrough = Vec::new();

    for (idx, params) in requests.iter().enumerate() {
        match GeoPoint::from_params(params) {
            Some(point) => groups
                .entry(group_key(params))
                .or_default()
                .push((idx, point)),
            None => passthrough.push(idx),
        }
    }

    // (first member index, params, members)
    let mut planned: Vec<(usize, Value, Vec<usize>)> = Vec::new();

    for members in groups.values() {
        let points: Vec<GeoPoint> = members.iter().map(|(_, p)| *p).collect();
        for c in cluster(&points, options) {
            let original: Vec<usize> = c.members.iter().map(|&m| members[m].0).collect();
            let first = original[0];
            let params = if original.len() == 1 {
                requests[first].clone()
            } else {
                c.centroid.write_into(&requests[first])
            };
            planned.push((first, params, original));
        }
    }
    for idx in passthrough {
        planned.push((idx, requests[idx].clone(), vec![idx]));
    }
    planned.sort_by_key(|(first, _, _)| *first);

    let mut mapping = vec![0; requests.len()];
    let mut optimized_requests = Vec::with_capacity(planned.len());
    for (slot, (_, params, members)) in planned.into_iter().enumerate() {
        for m in members {
            mapping[m] = slot;
        }
        optimized_requests.push(params);
    }

    debug!(
        requests = requests.len(),
        upstream_calls = optimized_requests.len(),
        "optimized geo batch"
    );
    OptimizedBatch {
        optimized_requests,
        mapping,
    }
}

/// Fan clustered responses back out to the original request order.
///
/// Each result is an independent clone, so callers mutating one response
/// never affect another request's copy.
pub fn reconstruct<T: Clone>(responses: &[T], mapping: &[usize]) -> Result<Vec<T>> {
    mapping
        .iter()
        .enumerate()
        .map(|(i, &slot)| {
            responses.get(slot).cloned().ok_or_else(|| {
                SkirnirError::InvalidInput(format!(
                    "request {i} maps to response {slot}, but only {} responses were given",
                    responses.len()
                ))
            })
        })
        .collect()
}

fn try_cluster(points: &[GeoPoint], options: &ClusterOptions) -> Result<Vec<RequestCluster>> {
    if let Some((idx, p)) = points.iter().enumerate().find(|(_, p)| !p.is_valid()) {
        return Err(SkirnirError::InvalidInput(format!(
            "point {idx} has invalid coordinates ({}, {})",
            p.lat, p.lon
        )));
    }
    if !(options.radius_km.is_finite() && options.radius_km >= 0.0) {
        return Err(SkirnirError::InvalidInput(format!(
            "invalid cluster radius {}",
            options.radius_km
        )));
    }

    let labels = dbscan(points, options.radius_km, options.min_points.max(1));

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut noise = Vec::new();
    for (idx, label) in labels.iter().enumerate() {
        match label {
            Some(c) => groups.entry(*c).or_default().push(idx),
            None => noise.push(vec![idx]),
        }
    }
    let mut member_sets: Vec<Vec<usize>> = groups.into_values().chain(noise).collect();

    let max = options.max_clusters.max(1);
    if member_sets.len() > max {
        member_sets = merge_overflow(member_sets, max);
    }

    let mut clusters = member_sets
        .into_iter()
        .map(|members| build_cluster(points, members))
        .collect::<Result<Vec<_>>>()?;
    clusters.sort_by_key(|c| c.members[0]);
    Ok(clusters)
}

/// Cluster label per point; `None` marks noise.
fn dbscan(points: &[GeoPoint], eps_km: f64, min_points: usize) -> Vec<Option<usize>> {
    let n = points.len();
    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next_label = 0;

    let region = |i: usize| -> Vec<usize> {
        (0..n)
            .filter(|&j| points[i].haversine_km(&points[j]) <= eps_km)
            .collect()
    };

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        let neighbours = region(i);
        if neighbours.len() < min_points {
            continue;
        }

        let label = next_label;
        next_label += 1;
        labels[i] = Some(label);

        let mut queue = neighbours;
        let mut cursor = 0;
        while cursor < queue.len() {
            let j = queue[cursor];
            cursor += 1;
            if labels[j].is_none() {
                labels[j] = Some(label);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;
            let expansion = region(j);
            if expansion.len() >= min_points {
                queue.extend(expansion);
            }
        }
    }
    labels
}

/// Keep the `max - 1` largest sets, merge the rest into one.
fn merge_overflow(mut sets: Vec<Vec<usize>>, max: usize) -> Vec<Vec<usize>> {
    for s in &mut sets {
        s.sort_unstable();
    }
    // Largest first; among equals, lower first member first.
    sets.sort_by(|a, b| b.len().cmp(&a.len()).then(a[0].cmp(&b[0])));
    let overflow: Vec<usize> = sets.split_off(max - 1).into_iter().flatten().collect();
    let merged = overflow.len();
    sets.push(overflow);
    debug!(max_clusters = max, merged_points = merged, "merged smallest clusters into overflow");
    sets
}

fn build_cluster(points: &[GeoPoint], mut members: Vec<usize>) -> Result<RequestCluster> {
    members.sort_unstable();
    let member_points: Vec<GeoPoint> = members.iter().map(|&i| points[i]).collect();
    let centroid = spherical_centroid(&member_points).ok_or_else(|| {
        SkirnirError::InvalidInput("cluster members have no defined centroid".into())
    })?;
    let radius_km = member_points
        .iter()
        .map(|p| centroid.haversine_km(p))
        .fold(0.0, f64::max);
    Ok(RequestCluster {
        centroid,
        members,
        radius_km,
    })
}

fn singletons(points: &[GeoPoint]) -> Vec<RequestCluster> {
    points
        .iter()
        .enumerate()
        .map(|(idx, p)| RequestCluster {
            centroid: *p,
            members: vec![idx],
            radius_km: 0.0,
        })
        .collect()
}

/// Params with the coordinate fields removed, serialised with sorted keys.
fn group_key(params: &Value) -> String {
    match params {
        Value::Object(map) => {
            let rest: BTreeMap<&String, &Value> = map
                .iter()
                .filter(|(k, _)| {
                    !matches!(
                        k.as_str(),
                        "lat" | "latitude" | "lon" | "lng" | "longitude"
                    )
                })
                .collect();
            serde_json::to_string(&rest).unwrap_or_default()
        }
        other => other.to_string(),
    }
}
