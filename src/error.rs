//! Skirnir error types

use std::time::Duration;

/// Error returned by a [`ProviderAdapter`](crate::providers::ProviderAdapter).
///
/// Adapters describe failures in HTTP terms; the orchestrator classifies
/// them into [`SkirnirError`] variants. `status: None` means the request
/// never produced a response (connection refused, DNS, reset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "provider responded {status}: {}", self.message),
            None => write!(f, "network failure: {}", self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    /// Failure that carries an HTTP status code.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Failure below the HTTP layer.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// 401 and 403 count against the credential that was used.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status, Some(401) | Some(403))
    }

    /// Network failures, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self.status {
            None => true,
            Some(429) => true,
            Some(s) => (500..600).contains(&s),
        }
    }
}

/// Skirnir error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum SkirnirError {
    // Caller misuse
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("operation '{operation}' not found on service '{provider}'")]
    OperationNotFound { provider: String, operation: String },

    // Quota gate
    #[error("rate limit exceeded for '{provider}' ({window} window)")]
    RateLimitExceeded { provider: String, window: String },

    // Provider failures
    #[error("transient failure from {provider}.{operation}: {source}")]
    TransientProvider {
        provider: String,
        operation: String,
        source: ProviderError,
    },

    #[error("permanent failure from {provider}.{operation}: {source} (params: {params})")]
    PermanentProvider {
        provider: String,
        operation: String,
        params: serde_json::Value,
        source: ProviderError,
    },

    #[error("{provider}.{operation} timed out after {after:?}")]
    Timeout {
        provider: String,
        operation: String,
        after: Duration,
    },

    // Collaborators
    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<serde_json::Error> for SkirnirError {
    fn from(err: serde_json::Error) -> Self {
        SkirnirError::Json(err.to_string())
    }
}

impl SkirnirError {
    /// Classify an adapter failure for the given call.
    pub fn from_provider(
        provider: &str,
        operation: &str,
        params: &serde_json::Value,
        err: ProviderError,
    ) -> Self {
        if err.is_retryable() {
            SkirnirError::TransientProvider {
                provider: provider.to_owned(),
                operation: operation.to_owned(),
                source: err,
            }
        } else {
            SkirnirError::PermanentProvider {
                provider: provider.to_owned(),
                operation: operation.to_owned(),
                params: params.clone(),
                source: err,
            }
        }
    }

    /// Whether the retry loop should try again.
    ///
    /// Quota rejections are not transient: they go to the fallback chain
    /// without touching the network.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SkirnirError::TransientProvider { .. } | SkirnirError::Timeout { .. }
        )
    }

    /// Whether the fallback chain may answer in place of this error.
    pub fn allows_fallback(&self) -> bool {
        self.is_transient() || matches!(self, SkirnirError::RateLimitExceeded { .. })
    }

    /// HTTP status from the provider, if the error came from one.
    pub fn status(&self) -> Option<u16> {
        match self {
            SkirnirError::TransientProvider { source, .. }
            | SkirnirError::PermanentProvider { source, .. } => source.status,
            _ => None,
        }
    }
}

/// Result type alias for Skirnir operations
pub type Result<T> = std::result::Result<T, SkirnirError>;
