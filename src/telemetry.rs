//! Telemetry metric name constants.
//!
//! Centralised metric names for skirnir operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `skirnir_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `provider`: registered service name (e.g. "weather", "routing")
//! - `operation`: adapter operation (e.g. "current", "forecast")
//! - `status`: outcome: "ok" or "error"
//! - `source`: where a payload came from: "network", "cache", "stale_cache", "static", "backup"

/// Total `execute` calls that reached a terminal outcome.
///
/// Labels: `provider`, `operation`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "skirnir_requests_total";

/// Adapter call duration in seconds (successful attempts only).
///
/// Labels: `provider`, `operation`.
pub const REQUEST_DURATION_SECONDS: &str = "skirnir_request_duration_seconds";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `provider`, `operation`.
pub const RETRIES_TOTAL: &str = "skirnir_retries_total";

/// Total response-cache hits.
///
/// Labels: `tier` ("volatile" | "durable" | "geo").
pub const CACHE_HITS_TOTAL: &str = "skirnir_cache_hits_total";

/// Total response-cache misses.
pub const CACHE_MISSES_TOTAL: &str = "skirnir_cache_misses_total";

/// Entries promoted from the volatile to the durable tier.
pub const CACHE_PROMOTIONS_TOTAL: &str = "skirnir_cache_promotions_total";

/// Calls rejected by the quota tracker before touching the network.
///
/// Labels: `provider`, `window`.
pub const QUOTA_REJECTIONS_TOTAL: &str = "skirnir_quota_rejections_total";

/// Payloads served by the fallback chain.
///
/// Labels: `provider`, `source`.
pub const FALLBACKS_TOTAL: &str = "skirnir_fallbacks_total";

/// Credentials deactivated after repeated auth failures.
///
/// Labels: `provider`.
pub const KEYS_DEACTIVATED_TOTAL: &str = "skirnir_keys_deactivated_total";

/// Upstream calls saved by geo clustering in batch execution.
///
/// Labels: `provider`, `operation`.
pub const GEO_CALLS_SAVED_TOTAL: &str = "skirnir_geo_calls_saved_total";
