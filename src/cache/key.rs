//! Deterministic cache keys.
//!
//! A key is `provider:operation:<digest>` where the digest covers the
//! canonical form of the params: object keys sorted, volatile fields (request
//! timestamps, nonces, cache busters) removed at every depth. SHA-256 keeps
//! keys stable across processes, which the durable tier needs.
//!
//! The *geo scope* is the same digest computed without coordinate fields. Two
//! requests with the same scope differ only in location, so a result cached
//! for one may answer the other if the points are close enough.

use sha2::{Digest, Sha256};
use serde_json::Value;

/// Params dropped before hashing unless configured otherwise.
pub const DEFAULT_VOLATILE_PARAMS: &[&str] = &[
    "timestamp",
    "ts",
    "_",
    "nonce",
    "request_id",
    "requestId",
    "cache_bust",
];

const COORDINATE_PARAMS: &[&str] = &["lat", "latitude", "lon", "lng", "longitude"];

/// Cache key plus geo scope for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub key: String,
    pub geo_scope: String,
}

impl CacheKey {
    /// Build the key for `provider.operation(params)`.
    pub fn new(provider: &str, operation: &str, params: &Value, volatile: &[String]) -> Self {
        let exact = canonical_json(params, &|k| volatile.iter().any(|v| v == k));
        let scoped = canonical_json(params, &|k| {
            volatile.iter().any(|v| v == k) || COORDINATE_PARAMS.contains(&k)
        });
        Self {
            key: format!("{provider}:{operation}:{}", digest(&exact)),
            geo_scope: format!("{provider}:{operation}:{}", digest(&scoped)),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Default volatile param list as owned strings.
pub fn default_volatile_params() -> Vec<String> {
    DEFAULT_VOLATILE_PARAMS.iter().map(|s| (*s).to_owned()).collect()
}

/// Hex SHA-256 prefix (128 bits) of the payload's canonical form.
pub fn content_hash(payload: &Value) -> String {
    digest(&canonical_json(payload, &|_| false))
}

fn digest(s: &str) -> String {
    let hash = Sha256::digest(s.as_bytes());
    hex::encode(&hash[..16])
}

/// Serialise with sorted object keys, skipping keys for which `skip` holds.
///
/// Independent of whether serde_json preserves insertion order.
fn canonical_json(value: &Value, skip: &dyn Fn(&str) -> bool) -> String {
    let mut out = String::new();
    write_canonical(value, skip, &mut out);
    out
}

fn write_canonical(value: &Value, skip: &dyn Fn(&str) -> bool, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().filter(|k| !skip(k)).collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], skip, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, skip, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(params: Value) -> CacheKey {
        CacheKey::new("weather", "current", &params, &default_volatile_params())
    }

    #[test]
    fn key_ignores_field_order() {
        let a = key(json!({"lat": 1.0, "lon": 2.0, "units": "metric"}));
        let b = key(json!({"units": "metric", "lon": 2.0, "lat": 1.0}));
        assert_eq!(a, b);
    }

    #[test]
    fn key_ignores_volatile_fields() {
        let a = key(json!({"city": "Oslo", "timestamp": 1700000000}));
        let b = key(json!({"city": "Oslo", "timestamp": 1700009999, "nonce": "x"}));
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn key_differs_on_params_operation_and_provider() {
        let base = key(json!({"city": "Oslo"}));
        assert_ne!(base, key(json!({"city": "Bergen"})));
        let other_op = CacheKey::new("weather", "forecast", &json!({"city": "Oslo"}), &[]);
        assert_ne!(base.key, other_op.key);
        assert!(base.key.starts_with("weather:current:"));
    }

    #[test]
    fn geo_scope_ignores_coordinates_only() {
        let a = key(json!({"lat": 1.0, "lon": 2.0, "units": "metric"}));
        let b = key(json!({"lat": 1.1, "lon": 2.1, "units": "metric"}));
        let c = key(json!({"lat": 1.0, "lon": 2.0, "units": "imperial"}));
        assert_ne!(a.key, b.key);
        assert_eq!(a.geo_scope, b.geo_scope);
        assert_ne!(a.geo_scope, c.geo_scope);
    }

    #[test]
    fn nested_volatile_fields_are_dropped() {
        let a = key(json!({"q": {"city": "Oslo", "ts": 1}}));
        let b = key(json!({"q": {"city": "Oslo", "ts": 2}}));
        assert_eq!(a, b);
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(
            content_hash(&json!({"a": 1, "b": [1, 2]})),
            content_hash(&json!({"b": [1, 2], "a": 1}))
        );
        assert_eq!(content_hash(&json!(null)).len(), 32);
    }
}
