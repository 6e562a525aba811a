use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use skirnir::providers::{AdapterRequest, Decision, decide};
use skirnir::{
    CachePolicy, CallOptions, Orchestrator, ProviderAdapter, ProviderError, RetryPolicy,
    ServicePolicy, SkirnirError,
};

/// Mock provider that fails N times then succeeds.
struct FailThenSucceed {
    fail_count: AtomicU32,
    fail_with: fn() -> ProviderError,
    total_calls: AtomicU32,
}

impl FailThenSucceed {
    fn new(failures: u32, fail_with: fn() -> ProviderError) -> Arc<Self> {
        Arc::new(Self {
            fail_count: AtomicU32::new(failures),
            fail_with,
            total_calls: AtomicU32::new(0),
        })
    }

    fn call_count(&self) -> u32 {
        self.total_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ProviderAdapter for FailThenSucceed {
    fn name(&self) -> &str {
        "mock-retry"
    }

    fn operations(&self) -> Vec<String> {
        vec!["fetch".into()]
    }

    async fn invoke(&self, _request: AdapterRequest<'_>) -> Result<Value, ProviderError> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let remaining = self.fail_count.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_count.fetch_sub(1, Ordering::Relaxed);
            return Err((self.fail_with)());
        }
        Ok(json!({"ok": true}))
    }
}

/// Never answers within any sensible timeout.
struct Sleepy {
    calls: AtomicU32,
}

#[async_trait]
impl ProviderAdapter for Sleepy {
    fn name(&self) -> &str {
        "sleepy"
    }

    fn operations(&self) -> Vec<String> {
        vec!["fetch".into()]
    }

    async fn invoke(&self, _request: AdapterRequest<'_>) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!({}))
    }
}

fn policy(max_retries: u32) -> ServicePolicy {
    ServicePolicy::new()
        .retry(
            RetryPolicy::new()
                .max_retries(max_retries)
                .initial_delay(Duration::from_millis(100))
                .jitter(false),
        )
        .cache(CachePolicy::disabled())
}

async fn orchestrator(adapter: Arc<dyn ProviderAdapter>, policy: ServicePolicy) -> Orchestrator {
    Orchestrator::builder()
        .register_service("svc", adapter, policy)
        .build()
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn retries_on_transient_error_then_succeeds() {
    let inner = FailThenSucceed::new(2, || ProviderError::status(503, "unavailable"));
    let orchestrator = orchestrator(inner.clone(), policy(3)).await;

    let start = tokio::time::Instant::now();
    let result = orchestrator
        .execute("svc", "fetch", json!({}), &CallOptions::new())
        .await
        .unwrap();
    assert_eq!(result, json!({"ok": true}));
    assert_eq!(inner.call_count(), 3);

    // 100ms * 2^1 + 100ms * 2^2
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(600), "waited {waited:?}");
    assert!(waited < Duration::from_millis(700), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn retries_on_rate_limit_and_network_errors() {
    let limited = FailThenSucceed::new(1, || ProviderError::status(429, "slow down"));
    let orchestrator_a = orchestrator(limited.clone(), policy(3)).await;
    orchestrator_a
        .execute("svc", "fetch", json!({}), &CallOptions::new())
        .await
        .unwrap();
    assert_eq!(limited.call_count(), 2);

    let dropped = FailThenSucceed::new(1, || ProviderError::network("connection reset"));
    let orchestrator_b = orchestrator(dropped.clone(), policy(3)).await;
    orchestrator_b
        .execute("svc", "fetch", json!({}), &CallOptions::new())
        .await
        .unwrap();
    assert_eq!(dropped.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_retries() {
    let inner = FailThenSucceed::new(10, || ProviderError::status(500, "boom"));
    let orchestrator = orchestrator(inner.clone(), policy(2)).await;

    let err = orchestrator
        .execute("svc", "fetch", json!({}), &CallOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SkirnirError::TransientProvider { .. }));
    assert_eq!(inner.call_count(), 3, "1 initial + 2 retries");
}

#[tokio::test(start_paused = true)]
async fn does_not_retry_client_errors() {
    let inner = FailThenSucceed::new(1, || ProviderError::status(400, "bad request"));
    let orchestrator = orchestrator(inner.clone(), policy(3)).await;

    let err = orchestrator
        .execute("svc", "fetch", json!({"city": "Oslo"}), &CallOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SkirnirError::PermanentProvider { .. }));
    assert!(err.to_string().contains("Oslo"), "params belong in the message: {err}");
    assert_eq!(inner.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn zero_retries_means_single_attempt() {
    let inner = FailThenSucceed::new(1, || ProviderError::status(502, "bad gateway"));
    let orchestrator = orchestrator(inner.clone(), policy(0)).await;

    assert!(
        orchestrator
            .execute("svc", "fetch", json!({}), &CallOptions::new())
            .await
            .is_err()
    );
    assert_eq!(inner.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_is_transient() {
    let sleepy = Arc::new(Sleepy {
        calls: AtomicU32::new(0),
    });
    let orchestrator = orchestrator(
        sleepy.clone(),
        policy(1).timeout(Duration::from_secs(2)),
    )
    .await;

    let err = orchestrator
        .execute("svc", "fetch", json!({}), &CallOptions::new())
        .await
        .unwrap_err();
    match err {
        SkirnirError::Timeout { after, .. } => assert_eq!(after, Duration::from_secs(2)),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(sleepy.calls.load(Ordering::Relaxed), 2);
}

#[test]
fn decision_table() {
    let policy = RetryPolicy::new().max_retries(2).jitter(false);
    let transient = SkirnirError::from_provider("svc", "op", &json!({}), ProviderError::status(503, ""));
    let permanent = SkirnirError::from_provider("svc", "op", &json!({}), ProviderError::status(404, ""));
    let limited = SkirnirError::RateLimitExceeded {
        provider: "svc".into(),
        window: "daily".into(),
    };

    assert_eq!(
        decide(&transient, 0, &policy, 1.0),
        Decision::Retry {
            delay: Duration::from_secs(1)
        }
    );
    assert_eq!(
        decide(&transient, 1, &policy, 1.0),
        Decision::Retry {
            delay: Duration::from_secs(2)
        }
    );
    assert_eq!(decide(&transient, 2, &policy, 1.0), Decision::Fallback);
    assert_eq!(decide(&permanent, 0, &policy, 1.0), Decision::Throw);
    assert_eq!(decide(&limited, 0, &policy, 1.0), Decision::Fallback);
}

#[test]
fn backoff_respects_jitter_bounds_and_cap() {
    let policy = RetryPolicy::new()
        .initial_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(5));
    for _ in 0..100 {
        let delay = policy.backoff_delay(1, policy.sample_jitter());
        assert!(delay >= Duration::from_millis(500) && delay < Duration::from_millis(1000));
    }
    assert_eq!(policy.backoff_delay(10, 1.0), Duration::from_secs(5));
}
