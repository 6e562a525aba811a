use std::time::Duration;

use serde_json::json;

use skirnir::{ProviderError, Result, SkirnirError};

#[test]
fn test_error_display() {
    let err = SkirnirError::ServiceNotFound("radar".to_string());
    assert!(err.to_string().contains("radar"));

    let err = SkirnirError::RateLimitExceeded {
        provider: "weather".into(),
        window: "15m".into(),
    };
    let msg = err.to_string();
    assert!(msg.contains("weather") && msg.contains("15m"));
}

#[test]
fn test_result_alias() {
    fn returns_error() -> Result<()> {
        Err(SkirnirError::Configuration("missing".into()))
    }
    assert!(returns_error().is_err());
}

// ============================================================================
// Provider error classification
// ============================================================================

#[test]
fn retryable_provider_errors() {
    assert!(ProviderError::network("reset").is_retryable());
    assert!(ProviderError::status(429, "").is_retryable());
    assert!(ProviderError::status(500, "").is_retryable());
    assert!(ProviderError::status(503, "").is_retryable());
    assert!(!ProviderError::status(400, "").is_retryable());
    assert!(!ProviderError::status(401, "").is_retryable());
    assert!(!ProviderError::status(404, "").is_retryable());
}

#[test]
fn auth_failures() {
    assert!(ProviderError::status(401, "").is_auth_failure());
    assert!(ProviderError::status(403, "").is_auth_failure());
    assert!(!ProviderError::status(429, "").is_auth_failure());
    assert!(!ProviderError::network("dns").is_auth_failure());
}

#[test]
fn from_provider_classifies() {
    let params = json!({"city": "Oslo"});
    let transient =
        SkirnirError::from_provider("weather", "current", &params, ProviderError::status(502, ""));
    assert!(matches!(transient, SkirnirError::TransientProvider { .. }));
    assert!(transient.is_transient());
    assert!(transient.allows_fallback());
    assert_eq!(transient.status(), Some(502));

    let permanent =
        SkirnirError::from_provider("weather", "current", &params, ProviderError::status(422, "bad"));
    assert!(!permanent.is_transient());
    assert!(!permanent.allows_fallback());
    let msg = permanent.to_string();
    assert!(msg.contains("weather.current"));
    assert!(msg.contains("Oslo"));
}

#[test]
fn timeouts_are_transient_and_quota_is_not() {
    let timeout = SkirnirError::Timeout {
        provider: "weather".into(),
        operation: "current".into(),
        after: Duration::from_secs(30),
    };
    assert!(timeout.is_transient());
    assert_eq!(timeout.status(), None);

    let quota = SkirnirError::RateLimitExceeded {
        provider: "weather".into(),
        window: "daily".into(),
    };
    assert!(!quota.is_transient());
    assert!(quota.allows_fallback());
}

#[test]
fn caller_errors_never_fall_back() {
    for err in [
        SkirnirError::ServiceNotFound("x".into()),
        SkirnirError::OperationNotFound {
            provider: "x".into(),
            operation: "y".into(),
        },
        SkirnirError::InvalidInput("z".into()),
    ] {
        assert!(!err.is_transient());
        assert!(!err.allows_fallback());
    }
}

#[test]
fn json_errors_convert() {
    let err: SkirnirError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
    assert!(matches!(err, SkirnirError::Json(_)));
}
