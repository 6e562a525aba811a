//! Fallback chain ordering and provenance.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use skirnir::providers::AdapterRequest;
use skirnir::{
    CachePolicy, CallOptions, FallbackPolicy, Orchestrator, ProviderAdapter, ProviderError,
    ResponseSource, RetryPolicy, ServicePolicy, SkirnirError,
};

struct Mock {
    name: &'static str,
    fail_with: Option<u16>,
    calls: AtomicU32,
}

impl Mock {
    fn healthy(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail_with: None,
            calls: AtomicU32::new(0),
        })
    }

    fn failing(name: &'static str, status: u16) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail_with: Some(status),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for Mock {
    fn name(&self) -> &str {
        self.name
    }

    fn operations(&self) -> Vec<String> {
        vec!["current".into()]
    }

    async fn invoke(&self, _request: AdapterRequest<'_>) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail_with {
            Some(status) => Err(ProviderError::status(status, "down")),
            None => Ok(json!({"from": self.name})),
        }
    }
}

fn no_retry() -> RetryPolicy {
    RetryPolicy::disabled()
}

#[tokio::test]
async fn static_payload_after_transient_failure() {
    let orchestrator = Orchestrator::builder()
        .register_service(
            "primary",
            Mock::failing("primary", 503),
            ServicePolicy::new()
                .retry(no_retry())
                .fallback(FallbackPolicy::new().static_payload(json!({"degraded": true}))),
        )
        .build()
        .await
        .unwrap();

    let outcome = orchestrator
        .execute_detailed("primary", "current", json!({}), &CallOptions::new())
        .await
        .unwrap();
    assert_eq!(outcome.source, ResponseSource::Static);
    assert_eq!(outcome.payload, json!({"degraded": true}));
}

#[tokio::test]
async fn backup_provider_answers_when_primary_is_down() {
    let primary = Mock::failing("primary", 500);
    let backup = Mock::healthy("backup");
    let orchestrator = Orchestrator::builder()
        .register_service(
            "primary",
            primary.clone(),
            ServicePolicy::new()
                .retry(no_retry())
                .fallback(FallbackPolicy::new().backup_provider("backup")),
        )
        .register_service("backup", backup.clone(), ServicePolicy::new())
        .build()
        .await
        .unwrap();

    let outcome = orchestrator
        .execute_detailed("primary", "current", json!({"q": 1}), &CallOptions::new())
        .await
        .unwrap();
    assert_eq!(outcome.source, ResponseSource::Backup("backup".into()));
    assert_eq!(outcome.payload, json!({"from": "backup"}));
    assert_eq!(primary.calls(), 1);
    assert_eq!(backup.calls(), 1);
    assert_eq!(orchestrator.service_metrics(Some("primary")).fallbacks, 1);
}

#[tokio::test]
async fn stages_run_in_order_until_one_answers() {
    // Nothing cached, so the stale stage yields nothing; the failing backup
    // is skipped and the static payload wins.
    let orchestrator = Orchestrator::builder()
        .register_service(
            "primary",
            Mock::failing("primary", 503),
            ServicePolicy::new().retry(no_retry()).fallback(
                FallbackPolicy::new()
                    .stale_cache()
                    .backup_provider("backup")
                    .static_payload(json!({"last": "resort"})),
            ),
        )
        .register_service(
            "backup",
            Mock::failing("backup", 503),
            ServicePolicy::new()
                .retry(no_retry())
                .fallback(FallbackPolicy::new().static_payload(json!({"backup": "static"}))),
        )
        .build()
        .await
        .unwrap();

    let outcome = orchestrator
        .execute_detailed("primary", "current", json!({}), &CallOptions::new())
        .await
        .unwrap();
    // The backup's own fallback chain is disabled when called as a backup.
    assert_eq!(outcome.source, ResponseSource::Static);
    assert_eq!(outcome.payload, json!({"last": "resort"}));
}

#[tokio::test]
async fn exhausted_chain_returns_original_error() {
    let orchestrator = Orchestrator::builder()
        .register_service(
            "primary",
            Mock::failing("primary", 503),
            ServicePolicy::new()
                .retry(no_retry())
                .fallback(FallbackPolicy::new().stale_cache()),
        )
        .build()
        .await
        .unwrap();

    let err = orchestrator
        .execute("primary", "current", json!({}), &CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(503));
}

#[tokio::test]
async fn disable_fallback_surfaces_error() {
    let orchestrator = Orchestrator::builder()
        .register_service(
            "primary",
            Mock::failing("primary", 503),
            ServicePolicy::new()
                .retry(no_retry())
                .fallback(FallbackPolicy::new().static_payload(json!({}))),
        )
        .build()
        .await
        .unwrap();

    let err = orchestrator
        .execute(
            "primary",
            "current",
            json!({}),
            &CallOptions::new().disable_fallback(true),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SkirnirError::TransientProvider { .. }));
}

#[tokio::test]
async fn stale_cache_is_skipped_when_caching_is_disabled() {
    let orchestrator = Orchestrator::builder()
        .register_service(
            "primary",
            Mock::failing("primary", 503),
            ServicePolicy::new()
                .retry(no_retry())
                .cache(CachePolicy::disabled())
                .fallback(FallbackPolicy::new().stale_cache().static_payload(json!("static"))),
        )
        .build()
        .await
        .unwrap();

    let outcome = orchestrator
        .execute_detailed("primary", "current", json!({}), &CallOptions::new())
        .await
        .unwrap();
    assert_eq!(outcome.source, ResponseSource::Static);
}

#[tokio::test]
async fn unknown_backup_is_rejected_at_build() {
    let result = Orchestrator::builder()
        .register_service(
            "primary",
            Mock::healthy("primary"),
            ServicePolicy::new().fallback(FallbackPolicy::new().backup_provider("ghost")),
        )
        .build()
        .await;
    assert!(matches!(result, Err(SkirnirError::Configuration(_))));
}

#[tokio::test]
async fn failure_streak_raises_alert_once() {
    let (notifier, mut rx) = skirnir::ChannelNotifier::new(16);
    let orchestrator = Orchestrator::builder()
        .notifier(Arc::new(notifier))
        .failure_alert_threshold(3)
        .register_service(
            "primary",
            Mock::failing("primary", 503),
            ServicePolicy::new()
                .retry(no_retry())
                .cache(CachePolicy::disabled())
                .timeout(Duration::from_secs(1)),
        )
        .build()
        .await
        .unwrap();

    for _ in 0..5 {
        let _ = orchestrator
            .execute("primary", "current", json!({}), &CallOptions::new())
            .await;
    }
    let alert = rx.try_recv().unwrap();
    assert_eq!(alert.level, skirnir::NotificationLevel::Error);
    assert_eq!(alert.subject, "primary");
    assert!(rx.try_recv().is_err(), "alert fires once per streak");
}
