//! Tests for metrics integration.
//!
//! Uses `metrics_util::debugging::DebuggingRecorder` to capture and assert
//! on emitted metrics without needing a real exporter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::MetricKind;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::{Value, json};

use skirnir::providers::AdapterRequest;
use skirnir::telemetry;
use skirnir::{
    CachePolicy, CallOptions, FallbackPolicy, Orchestrator, ProviderAdapter, ProviderError,
    RateLimitPolicy, RetryPolicy, ServicePolicy,
};

// ============================================================================
// Mock providers
// ============================================================================

struct Healthy;

#[async_trait]
impl ProviderAdapter for Healthy {
    fn name(&self) -> &str {
        "healthy"
    }

    fn operations(&self) -> Vec<String> {
        vec!["current".into()]
    }

    async fn invoke(&self, request: AdapterRequest<'_>) -> Result<Value, ProviderError> {
        Ok(json!({"echo": request.params}))
    }
}

struct Unavailable;

#[async_trait]
impl ProviderAdapter for Unavailable {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn operations(&self) -> Vec<String> {
        vec!["current".into()]
    }

    async fn invoke(&self, _request: AdapterRequest<'_>) -> Result<Value, ProviderError> {
        Err(ProviderError::status(503, "maintenance"))
    }
}

// ============================================================================
// Snapshot type alias for readability
// ============================================================================

type SnapshotVec = Vec<(
    metrics_util::CompositeKey,
    Option<metrics::Unit>,
    Option<metrics::SharedString>,
    DebugValue,
)>;

// ============================================================================
// Helpers
// ============================================================================

/// Sum all counter values matching a given metric name.
fn counter_total(snapshot: &SnapshotVec, name: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| key.kind() == MetricKind::Counter && key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Counter value for a metric carrying the given label.
fn counter_with_label(snapshot: &SnapshotVec, name: &str, label: (&str, &str)) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| {
            key.kind() == MetricKind::Counter
                && key.key().name() == name
                && key
                    .key()
                    .labels()
                    .any(|l| l.key() == label.0 && l.value() == label.1)
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Check if any histogram entries exist for a given metric name.
fn has_histogram(snapshot: &SnapshotVec, name: &str) -> bool {
    snapshot
        .iter()
        .any(|(key, _, _, _)| key.kind() == MetricKind::Histogram && key.key().name() == name)
}

/// Runs async code within a local recorder scope on the multi-thread runtime.
///
/// `block_in_place` keeps the sync `with_local_recorder` closure on the
/// current thread while `block_on` drives the inner async work.
fn recorded<F: Future>(work: F) -> (F::Output, Snapshotter) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let output = metrics::with_local_recorder(&recorder, || {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(work))
    });
    (output, snapshotter)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new()
        .max_retries(2)
        .initial_delay(Duration::from_millis(1))
        .jitter(false)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn successful_request_records_metrics() {
    let (result, snapshotter) = recorded(async {
        let orchestrator = Orchestrator::builder()
            .register_service("weather", Arc::new(Healthy), ServicePolicy::new())
            .build()
            .await?;
        orchestrator
            .execute("weather", "current", json!({"city": "Oslo"}), &CallOptions::new())
            .await?;
        orchestrator
            .execute("weather", "current", json!({"city": "Oslo"}), &CallOptions::new())
            .await
    });
    assert!(result.is_ok());

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::REQUESTS_TOTAL), 2);
    assert_eq!(
        counter_with_label(&snapshot, telemetry::REQUESTS_TOTAL, ("status", "ok")),
        2
    );
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_MISSES_TOTAL), 1);
    assert_eq!(
        counter_with_label(&snapshot, telemetry::CACHE_HITS_TOTAL, ("tier", "volatile")),
        1
    );
    assert!(
        has_histogram(&snapshot, telemetry::REQUEST_DURATION_SECONDS),
        "expected a duration histogram entry"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn retries_and_fallback_are_counted() {
    let (result, snapshotter) = recorded(async {
        let orchestrator = Orchestrator::builder()
            .register_service(
                "weather",
                Arc::new(Unavailable),
                ServicePolicy::new()
                    .retry(fast_retry())
                    .fallback(FallbackPolicy::new().static_payload(json!({"degraded": true}))),
            )
            .build()
            .await?;
        orchestrator
            .execute("weather", "current", json!({}), &CallOptions::new())
            .await
    });
    assert_eq!(result.unwrap(), json!({"degraded": true}));

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::RETRIES_TOTAL), 2);
    assert_eq!(
        counter_with_label(&snapshot, telemetry::FALLBACKS_TOTAL, ("source", "static")),
        1
    );
    assert!(!has_histogram(&snapshot, telemetry::REQUEST_DURATION_SECONDS));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn quota_rejection_is_counted() {
    let (result, snapshotter) = recorded(async {
        let orchestrator = Orchestrator::builder()
            .register_service(
                "weather",
                Arc::new(Healthy),
                ServicePolicy::new()
                    .cache(CachePolicy::disabled())
                    .rate_limit(RateLimitPolicy::new().window("1m", Duration::from_secs(60), 1)),
            )
            .build()
            .await?;
        orchestrator
            .execute("weather", "current", json!({}), &CallOptions::new())
            .await?;
        orchestrator
            .execute("weather", "current", json!({}), &CallOptions::new())
            .await
    });
    assert!(result.is_err());

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter_with_label(&snapshot, telemetry::QUOTA_REJECTIONS_TOTAL, ("window", "1m")),
        1
    );
    assert_eq!(
        counter_with_label(&snapshot, telemetry::REQUESTS_TOTAL, ("status", "error")),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn batch_records_saved_calls() {
    let (result, snapshotter) = recorded(async {
        let orchestrator = Orchestrator::builder()
            .register_service("weather", Arc::new(Healthy), ServicePolicy::new())
            .build()
            .await?;
        orchestrator
            .execute_batch(
                "weather",
                "current",
                vec![
                    json!({"lat": 59.91, "lon": 10.75}),
                    json!({"lat": 59.92, "lon": 10.76}),
                    json!({"lat": 59.93, "lon": 10.74}),
                ],
                &CallOptions::new(),
            )
            .await
    });
    assert_eq!(result.unwrap().len(), 3);

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::GEO_CALLS_SAVED_TOTAL), 2);
}

#[tokio::test]
async fn metrics_are_noop_without_recorder() {
    // Verify no panics when no recorder is installed.
    let orchestrator = Orchestrator::builder()
        .register_service("weather", Arc::new(Healthy), ServicePolicy::new())
        .build()
        .await
        .unwrap();
    orchestrator
        .execute("weather", "current", json!({}), &CallOptions::new())
        .await
        .unwrap();
}
